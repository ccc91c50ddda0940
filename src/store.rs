#![forbid(unsafe_code)]

//! Link persistence for StudyBeats.
//!
//! The embed subsystem only needs four operations from the relational store
//! (`LinkStore`); `LinkDatabase` implements them on a local libsql file and
//! adds the handful of write helpers the binaries and tests use.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, Value, params};
use serde::{Deserialize, Serialize};

use crate::classify::{Provider, classify};

/// One submitted music link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkItem {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub genre: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub submitted_by: String,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_confirmed_at: Option<DateTime<Utc>>,
}

/// Everything needed to create a link. `url` is fixed for the link's lifetime.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub id: String,
    pub url: String,
    pub title: String,
    pub genre: String,
    pub kind: String,
    pub submitted_by: String,
    pub added_at: DateTime<Utc>,
}

/// Partial update. `None` fields are left untouched; the URL cannot change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPatch {
    pub title: Option<String>,
    pub genre: Option<String>,
    pub kind: Option<String>,
    pub title_confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFilter {
    All,
    Provider(Provider),
    Genre(String),
}

#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn list_links(&self, filter: &LinkFilter) -> Result<Vec<LinkItem>>;
    /// Returns `false` when no link has this id.
    async fn update_link(&self, id: &str, patch: &LinkPatch) -> Result<bool>;
    /// Returns `false` when no link has this id.
    async fn delete_link(&self, id: &str) -> Result<bool>;
    /// Returns the number of membership rows removed.
    async fn delete_combination_memberships(&self, link_id: &str) -> Result<u64>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            genre TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL DEFAULT '',
            submitted_by TEXT NOT NULL DEFAULT '',
            added_at TEXT NOT NULL,
            title_confirmed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS combinations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_by TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS combination_links (
            combination_id TEXT NOT NULL REFERENCES combinations(id) ON DELETE CASCADE,
            link_id TEXT NOT NULL REFERENCES links(id),
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (combination_id, link_id)
        );

        CREATE INDEX IF NOT EXISTS idx_links_genre ON links(genre);
        CREATE INDEX IF NOT EXISTS idx_combination_links_link ON combination_links(link_id);
        "#,
    )
    .await?;
    Ok(())
}

// Host patterns used to pre-filter links by provider in SQL. Matches what the
// classifier treats as each provider's domain.
fn provider_patterns(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::YouTube => &["%youtube.com%", "%youtu.be%"],
        Provider::Spotify => &["%spotify.com%"],
        Provider::SoundCloud => &["%soundcloud.com%"],
        Provider::Unsupported => &[],
    }
}

const LINK_COLUMNS: &str =
    "id, url, title, genre, kind, submitted_by, added_at, title_confirmed_at";

/// libsql-backed link store.
#[derive(Clone)]
pub struct LinkDatabase {
    conn: Connection,
}

impl LinkDatabase {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening link DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a new link. Rejects URLs that do not parse.
    pub async fn insert_link(&self, link: &NewLink) -> Result<()> {
        let url = link.url.trim();
        if url.is_empty() {
            bail!("link {} has an empty url", link.id);
        }
        url::Url::parse(url).with_context(|| format!("link {} has an invalid url", link.id))?;

        self.conn
            .execute(
                r#"
                INSERT INTO links (id, url, title, genre, kind, submitted_by, added_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    link.id.as_str(),
                    url,
                    link.title.as_str(),
                    link.genre.as_str(),
                    link.kind.as_str(),
                    link.submitted_by.as_str(),
                    link.added_at.to_rfc3339(),
                ],
            )
            .await
            .with_context(|| format!("inserting link {}", link.id))?;
        Ok(())
    }

    pub async fn get_link(&self, id: &str) -> Result<Option<LinkItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {LINK_COLUMNS} FROM links WHERE id = ?1"))
            .await?;
        let mut rows = stmt.query([id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_link(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_combination(&self, id: &str, name: &str, created_by: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO combinations (id, name, created_by, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, created_by, Utc::now().to_rfc3339()],
            )
            .await
            .with_context(|| format!("inserting combination {id}"))?;
        Ok(())
    }

    /// Appends `link_id` to the end of a combination.
    pub async fn add_to_combination(&self, combination_id: &str, link_id: &str) -> Result<()> {
        let tx = self.conn.transaction().await?;
        let mut rows = tx
            .query(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM combination_links WHERE combination_id = ?1",
                [combination_id],
            )
            .await?;
        let position: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        drop(rows);

        tx.execute(
            "INSERT INTO combination_links (combination_id, link_id, position) VALUES (?1, ?2, ?3)",
            params![combination_id, link_id, position],
        )
        .await
        .with_context(|| format!("adding {link_id} to combination {combination_id}"))?;
        tx.commit().await?;
        Ok(())
    }

    /// Link ids of a combination in playback order.
    pub async fn combination_members(&self, combination_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT link_id FROM combination_links
                WHERE combination_id = ?1
                ORDER BY position ASC
                "#,
            )
            .await?;
        let mut rows = stmt.query([combination_id]).await?;
        let mut members = Vec::new();
        while let Some(row) = rows.next().await? {
            members.push(row.get::<String>(0)?);
        }
        Ok(members)
    }

    async fn query_links(&self, sql: &str, args: Vec<String>) -> Result<Vec<LinkItem>> {
        let mut stmt = self.conn.prepare(sql).await?;
        let values: Vec<Value> = args.into_iter().map(Value::from).collect();
        let mut rows = stmt.query(values).await?;
        let mut links = Vec::new();
        while let Some(row) = rows.next().await? {
            links.push(row_to_link(&row)?);
        }
        Ok(links)
    }
}

#[async_trait]
impl LinkStore for LinkDatabase {
    async fn list_links(&self, filter: &LinkFilter) -> Result<Vec<LinkItem>> {
        let order = "ORDER BY added_at ASC, rowid ASC";
        match filter {
            LinkFilter::All => {
                self.query_links(&format!("SELECT {LINK_COLUMNS} FROM links {order}"), vec![])
                    .await
            }
            LinkFilter::Genre(genre) => {
                self.query_links(
                    &format!("SELECT {LINK_COLUMNS} FROM links WHERE genre = ?1 {order}"),
                    vec![genre.clone()],
                )
                .await
            }
            LinkFilter::Provider(Provider::Unsupported) => {
                let all = self.list_links(&LinkFilter::All).await?;
                Ok(all
                    .into_iter()
                    .filter(|link| classify(&link.url).provider() == Provider::Unsupported)
                    .collect())
            }
            LinkFilter::Provider(provider) => {
                let patterns = provider_patterns(*provider);
                let clause = (1..=patterns.len())
                    .map(|idx| format!("url LIKE ?{idx}"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                self.query_links(
                    &format!("SELECT {LINK_COLUMNS} FROM links WHERE {clause} {order}"),
                    patterns.iter().map(|pattern| pattern.to_string()).collect(),
                )
                .await
            }
        }
    }

    async fn update_link(&self, id: &str, patch: &LinkPatch) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE links SET
                    title = COALESCE(?2, title),
                    genre = COALESCE(?3, genre),
                    kind = COALESCE(?4, kind),
                    title_confirmed_at = COALESCE(?5, title_confirmed_at)
                WHERE id = ?1
                "#,
                params![
                    id,
                    patch.title.as_deref(),
                    patch.genre.as_deref(),
                    patch.kind.as_deref(),
                    patch.title_confirmed_at.map(|at| at.to_rfc3339()),
                ],
            )
            .await
            .with_context(|| format!("updating link {id}"))?;
        Ok(changed > 0)
    }

    async fn delete_link(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM links WHERE id = ?1", [id])
            .await
            .with_context(|| format!("deleting link {id}"))?;
        Ok(removed > 0)
    }

    async fn delete_combination_memberships(&self, link_id: &str) -> Result<u64> {
        let removed = self
            .conn
            .execute("DELETE FROM combination_links WHERE link_id = ?1", [link_id])
            .await
            .with_context(|| format!("deleting memberships of link {link_id}"))?;
        Ok(removed)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing stored timestamp {raw}"))?
        .with_timezone(&Utc))
}

/// Column order must match `LINK_COLUMNS`.
fn row_to_link(row: &Row) -> Result<LinkItem> {
    let added_at: String = row.get(6)?;
    let title_confirmed_at: Option<String> = row.get(7)?;
    Ok(LinkItem {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        genre: row.get(3)?,
        kind: row.get(4)?,
        submitted_by: row.get(5)?,
        added_at: parse_timestamp(&added_at)?,
        title_confirmed_at: title_confirmed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_link(id: &str, url: &str) -> NewLink {
        NewLink {
            id: id.into(),
            url: url.into(),
            title: String::new(),
            genre: "lofi".into(),
            kind: "video".into(),
            submitted_by: "tester".into(),
            added_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
        }
    }
}
