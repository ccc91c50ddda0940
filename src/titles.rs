#![forbid(unsafe_code)]

//! Human-readable titles: normalization, the "is this title usable" test,
//! cache-first lookups and the bulk backfill over stored links.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{ProviderRef, classify};
use crate::clock::Clock;
use crate::error::{EmbedErrorKind, ProviderError};
use crate::metadata_cache::MetadataCache;
use crate::providers::{MetadataProvider, ProviderMetadata, YOUTUBE_BATCH_LIMIT};
use crate::store::{LinkFilter, LinkPatch, LinkStore};

/// Collapses every run of whitespace (spaces, tabs, newlines) into a single
/// space and trims both ends.
pub fn normalize_title(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A title needs replacing when it is empty, whitespace-only or itself looks
/// like a URL (a common placeholder for freshly submitted links).
pub fn is_missing_title(title: &str) -> bool {
    let trimmed = title.trim();
    trimmed.is_empty() || looks_like_url(trimmed)
}

fn looks_like_url(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    if ["http://", "https://", "www."]
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return true;
    }
    !lowered.contains(char::is_whitespace)
        && ["youtube.com/", "youtu.be/", "spotify.com/", "soundcloud.com/"]
            .iter()
            .any(|host| lowered.contains(host))
}

/// Cache-first title lookups backed by a [`MetadataProvider`].
#[derive(Clone)]
pub struct TitleFetcher {
    provider: Arc<dyn MetadataProvider>,
    cache: Arc<MetadataCache>,
}

impl TitleFetcher {
    pub fn new(provider: Arc<dyn MetadataProvider>, cache: Arc<MetadataCache>) -> Self {
        Self { provider, cache }
    }

    /// Resolves one item. `Ok(None)` means the provider has no title for it.
    pub async fn fetch_title(
        &self,
        reference: &ProviderRef,
    ) -> Result<Option<ProviderMetadata>, ProviderError> {
        let Some(key) = reference.cache_key() else {
            return Ok(None);
        };
        if let Some(entry) = self.cache.get(&key) {
            debug!("metadata cache hit: {key}");
            return Ok(Some(ProviderMetadata {
                title: entry.title,
                channel: entry.channel,
            }));
        }

        debug!("metadata cache miss: {key}");
        let found = self.provider.fetch_single(reference).await?;
        Ok(found.and_then(|metadata| self.remember(&key, metadata)))
    }

    /// Resolves many YouTube ids, consulting the cache first and batching the
    /// rest into provider calls of at most [`YOUTUBE_BATCH_LIMIT`] ids.
    ///
    /// A failed batch is logged and skipped; ids from it (and ids the
    /// provider does not know) are absent from the result.
    pub async fn fetch_youtube_titles(&self, video_ids: &[String]) -> HashMap<String, ProviderMetadata> {
        let mut resolved = HashMap::new();
        let mut misses: Vec<String> = Vec::new();

        for id in video_ids {
            if resolved.contains_key(id) || misses.contains(id) {
                continue;
            }
            match self.cache.get(&youtube_key(id)) {
                Some(entry) => {
                    resolved.insert(
                        id.clone(),
                        ProviderMetadata {
                            title: entry.title,
                            channel: entry.channel,
                        },
                    );
                }
                None => misses.push(id.clone()),
            }
        }

        for chunk in misses.chunks(YOUTUBE_BATCH_LIMIT) {
            match self.provider.fetch_batch(chunk).await {
                Ok(found) => {
                    for (id, metadata) in found {
                        if let Some(metadata) = self.remember(&youtube_key(&id), metadata) {
                            resolved.insert(id, metadata);
                        }
                    }
                }
                Err(err) => {
                    warn!("title batch of {} ids failed: {err}", chunk.len());
                }
            }
        }
        resolved
    }

    /// Normalizes and caches a fetched title. Empty titles are dropped.
    fn remember(&self, key: &str, metadata: ProviderMetadata) -> Option<ProviderMetadata> {
        let title = normalize_title(&metadata.title);
        if title.is_empty() {
            return None;
        }
        let channel = metadata
            .channel
            .as_deref()
            .map(normalize_title)
            .filter(|channel| !channel.is_empty());
        // Storage failures only cost us the cache entry.
        if let Err(err) = self.cache.set(key, &title, channel.as_deref()) {
            debug!("{} for {key}: {err}", EmbedErrorKind::StorageFailure);
        }
        Some(ProviderMetadata { title, channel })
    }
}

fn youtube_key(video_id: &str) -> String {
    format!("youtube:{video_id}")
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub scanned: usize,
    pub missing: usize,
    pub updated: usize,
    pub unresolved: usize,
    pub failed: usize,
}

/// Fills in missing titles of stored links.
pub struct TitleBackfill {
    store: Arc<dyn LinkStore>,
    fetcher: TitleFetcher,
    clock: Arc<dyn Clock>,
}

impl TitleBackfill {
    pub fn new(store: Arc<dyn LinkStore>, fetcher: TitleFetcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fetcher,
            clock,
        }
    }

    /// One pass over every link. Links whose title cannot be resolved keep
    /// their current title.
    pub async fn run(&self) -> Result<BackfillReport> {
        let links = self
            .store
            .list_links(&LinkFilter::All)
            .await
            .context("listing links for title backfill")?;
        let mut report = BackfillReport {
            scanned: links.len(),
            ..BackfillReport::default()
        };

        // video id -> link ids (several links may point at the same video)
        let mut youtube: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut others: Vec<(String, ProviderRef)> = Vec::new();
        for link in links.iter().filter(|link| is_missing_title(&link.title)) {
            report.missing += 1;
            match classify(&link.url) {
                ProviderRef::YouTube { video_id } => {
                    youtube.entry(video_id).or_default().push(link.id.clone());
                }
                reference if reference.is_supported() => {
                    others.push((link.id.clone(), reference));
                }
                _ => report.unresolved += 1,
            }
        }

        let video_ids: Vec<String> = youtube.keys().cloned().collect();
        let titles = self.fetcher.fetch_youtube_titles(&video_ids).await;
        for (video_id, link_ids) in &youtube {
            match titles.get(video_id) {
                Some(metadata) => {
                    for link_id in link_ids {
                        self.apply(link_id, &metadata.title, &mut report).await;
                    }
                }
                None => report.unresolved += link_ids.len(),
            }
        }

        for (link_id, reference) in &others {
            match self.fetcher.fetch_title(reference).await {
                Ok(Some(metadata)) => self.apply(link_id, &metadata.title, &mut report).await,
                Ok(None) => report.unresolved += 1,
                Err(err) => {
                    warn!("title lookup for link {link_id} failed: {err}");
                    report.unresolved += 1;
                }
            }
        }

        info!(
            "title backfill: {} scanned, {} missing, {} updated, {} unresolved, {} failed",
            report.scanned, report.missing, report.updated, report.unresolved, report.failed
        );
        Ok(report)
    }

    async fn apply(&self, link_id: &str, title: &str, report: &mut BackfillReport) {
        let patch = LinkPatch {
            title: Some(title.to_owned()),
            title_confirmed_at: Some(self.clock.now()),
            ..LinkPatch::default()
        };
        match self.store.update_link(link_id, &patch).await {
            Ok(true) => report.updated += 1,
            Ok(false) => {
                debug!("link {link_id} vanished before its title was written");
                report.failed += 1;
            }
            Err(err) => {
                warn!("writing title for link {link_id} failed: {err:#}");
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::providers::testing::FakeMetadataProvider;
    use crate::storage::MemoryStorage;
    use crate::store::LinkDatabase;
    use crate::store::test_support::new_link;
    use chrono::DateTime;
    use tempfile::tempdir;

    fn cache(clock: Arc<ManualClock>) -> Arc<MetadataCache> {
        Arc::new(MetadataCache::new(Arc::new(MemoryStorage::new()), clock))
    }

    fn video_id(i: usize) -> String {
        format!("vid{i:08}")
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_title("  Lofi\n\tBeats   to  study "), "Lofi Beats to study");
        assert_eq!(normalize_title("\n\t "), "");
    }

    #[test]
    fn missing_title_detection() {
        assert!(is_missing_title(""));
        assert!(is_missing_title("   \t"));
        assert!(is_missing_title("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_missing_title("www.example.com/song"));
        assert!(is_missing_title("youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(!is_missing_title("Chill beats"));
        assert!(!is_missing_title("My favourite youtube.com/ mix"));
    }

    #[tokio::test]
    async fn large_requests_are_split_into_batches_of_fifty() {
        let provider = Arc::new(FakeMetadataProvider::default());
        let fetcher = TitleFetcher::new(provider.clone(), cache(Arc::new(ManualClock::default())));
        let ids: Vec<String> = (0..120).map(video_id).collect();

        let found = fetcher.fetch_youtube_titles(&ids).await;
        assert_eq!(provider.batch_call_sizes(), vec![50, 50, 20]);
        assert_eq!(found.len(), 120);
        assert_eq!(found[&video_id(7)].title, format!("Title {}", video_id(7)));

        // Everything is cached now.
        fetcher.fetch_youtube_titles(&ids).await;
        assert_eq!(provider.batch_call_sizes().len(), 3);
    }

    #[tokio::test]
    async fn failed_batches_are_skipped() {
        let provider = Arc::new(FakeMetadataProvider::failing());
        let fetcher = TitleFetcher::new(provider.clone(), cache(Arc::new(ManualClock::default())));
        let found = fetcher.fetch_youtube_titles(&[video_id(1)]).await;
        assert!(found.is_empty());
        assert_eq!(provider.batch_call_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn single_lookup_is_cached() {
        let provider = Arc::new(FakeMetadataProvider::default());
        let fetcher = TitleFetcher::new(provider.clone(), cache(Arc::new(ManualClock::default())));
        let reference = classify("https://open.spotify.com/album/xyz");

        let first = fetcher.fetch_title(&reference).await.unwrap().unwrap();
        let second = fetcher.fetch_title(&reference).await.unwrap().unwrap();
        assert_eq!(first.title, "Title album/xyz");
        assert_eq!(first, second);
        assert_eq!(provider.single_call_count(), 1);
    }

    #[tokio::test]
    async fn backfill_updates_only_resolved_titles() -> Result<()> {
        let dir = tempdir()?;
        let db = Arc::new(LinkDatabase::open(&dir.path().join("links.db")).await?);
        for i in 0..120 {
            let mut link = new_link(&format!("link-{i}"), &format!("https://youtu.be/{}", video_id(i)));
            if i == 3 {
                link.title = "Already named".into();
            }
            if i == 5 {
                link.title = link.url.clone();
            }
            db.insert_link(&link).await?;
        }
        db.insert_link(&new_link("sc", "https://soundcloud.com/artist/track"))
            .await?;
        db.insert_link(&new_link("web", "https://example.com/song"))
            .await?;

        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_750_000_000, 0).context("timestamp")?,
        ));
        let missing = video_id(10);
        let provider = Arc::new(FakeMetadataProvider::without(&[missing.as_str()]));
        let fetcher = TitleFetcher::new(provider.clone(), cache(clock.clone()));
        let backfill = TitleBackfill::new(db.clone(), fetcher, clock.clone());

        let report = backfill.run().await?;
        assert_eq!(provider.batch_call_sizes(), vec![50, 50, 19]);
        assert_eq!(report.scanned, 122);
        assert_eq!(report.missing, 121);
        assert_eq!(report.updated, 119);
        assert_eq!(report.unresolved, 2);

        let named = db.get_link("link-3").await?.context("link-3")?;
        assert_eq!(named.title, "Already named");
        let replaced = db.get_link("link-5").await?.context("link-5")?;
        assert_eq!(replaced.title, format!("Title {}", video_id(5)));
        assert_eq!(replaced.title_confirmed_at, Some(clock.now()));

        let untouched = db.get_link("link-10").await?.context("link-10")?;
        assert_eq!(untouched.title, "");
        assert_eq!(untouched.title_confirmed_at, None);

        let soundcloud = db.get_link("sc").await?.context("sc")?;
        assert_eq!(
            soundcloud.title,
            "Title https://soundcloud.com/artist/track"
        );
        Ok(())
    }
}
