#![forbid(unsafe_code)]

//! Periodic availability sweep over stored YouTube links.
//!
//! Each link is checked one after another. Links confirmed gone are removed
//! together with their combination memberships (memberships first, so no
//! membership ever points at a missing link). A failure on one link is
//! logged and the sweep moves on.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{Provider, ProviderRef, classify};
use crate::providers::{AvailabilityChecker, AvailabilityOutcome};
use crate::store::{LinkFilter, LinkItem, LinkStore};

/// What to do when the availability check itself could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckFailurePolicy {
    /// Leave the link alone; the next sweep retries it.
    #[default]
    Skip,
    /// Treat an unreachable provider like a confirmed removal.
    Remove,
}

impl CheckFailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" | "keep" | "defer" => Some(Self::Skip),
            "remove" | "delete" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for CheckFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skip => "skip",
            Self::Remove => "remove",
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub available: usize,
    pub removed: usize,
    pub not_found: usize,
    pub unavailable: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct AvailabilitySweeper {
    store: Arc<dyn LinkStore>,
    checker: Arc<dyn AvailabilityChecker>,
    policy: CheckFailurePolicy,
}

impl AvailabilitySweeper {
    pub fn new(
        store: Arc<dyn LinkStore>,
        checker: Arc<dyn AvailabilityChecker>,
        policy: CheckFailurePolicy,
    ) -> Self {
        Self {
            store,
            checker,
            policy,
        }
    }

    /// Runs one sweep. Only a failure to list the candidate links is
    /// returned as an error.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let links = self
            .store
            .list_links(&LinkFilter::Provider(Provider::YouTube))
            .await
            .context("listing youtube links for sweep")?;

        let mut report = SweepReport::default();
        for link in &links {
            let ProviderRef::YouTube { video_id } = classify(&link.url) else {
                debug!("sweep skipping {}: no video id in {}", link.id, link.url);
                report.skipped += 1;
                continue;
            };

            report.checked += 1;
            let remove = match self.checker.check(&video_id).await {
                AvailabilityOutcome::Available => {
                    report.available += 1;
                    false
                }
                AvailabilityOutcome::NotFound => {
                    report.not_found += 1;
                    true
                }
                AvailabilityOutcome::Unavailable(status) => {
                    debug!("video {video_id} unavailable (HTTP {status})");
                    report.unavailable += 1;
                    true
                }
                AvailabilityOutcome::CheckFailed(reason) => match self.policy {
                    CheckFailurePolicy::Skip => {
                        warn!("availability check for {video_id} failed, keeping link {}: {reason}", link.id);
                        report.deferred += 1;
                        false
                    }
                    CheckFailurePolicy::Remove => {
                        warn!("availability check for {video_id} failed, removing link {}: {reason}", link.id);
                        true
                    }
                },
            };

            if remove {
                match self.remove(link).await {
                    Ok(()) => report.removed += 1,
                    Err(err) => {
                        warn!("removing link {} failed: {err:#}", link.id);
                        report.errors += 1;
                    }
                }
            }
        }

        info!(
            "sweep finished: {} checked, {} removed, {} deferred, {} skipped, {} errors",
            report.checked, report.removed, report.deferred, report.skipped, report.errors
        );
        Ok(report)
    }

    async fn remove(&self, link: &LinkItem) -> Result<()> {
        let memberships = self
            .store
            .delete_combination_memberships(&link.id)
            .await
            .with_context(|| format!("deleting memberships of {}", link.id))?;
        let deleted = self
            .store
            .delete_link(&link.id)
            .await
            .with_context(|| format!("deleting link {}", link.id))?;
        info!(
            "removed link {} ({}) and {memberships} memberships{}",
            link.id,
            link.url,
            if deleted { "" } else { "; link was already gone" }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LinkDatabase;
    use crate::store::test_support::new_link;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Answers from a fixed table; unknown ids are available.
    #[derive(Default)]
    struct ScriptedChecker {
        outcomes: HashMap<String, AvailabilityOutcome>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedChecker {
        fn with(outcomes: &[(&str, AvailabilityOutcome)]) -> Self {
            Self {
                outcomes: outcomes
                    .iter()
                    .map(|(id, outcome)| (id.to_string(), outcome.clone()))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AvailabilityChecker for ScriptedChecker {
        async fn check(&self, video_id: &str) -> AvailabilityOutcome {
            self.seen.lock().push(video_id.to_owned());
            self.outcomes
                .get(video_id)
                .cloned()
                .unwrap_or(AvailabilityOutcome::Available)
        }
    }

    /// Store whose listing always fails.
    struct BrokenStore;

    #[async_trait]
    impl LinkStore for BrokenStore {
        async fn list_links(&self, _filter: &LinkFilter) -> Result<Vec<LinkItem>> {
            anyhow::bail!("database is locked")
        }
        async fn update_link(&self, _id: &str, _patch: &crate::store::LinkPatch) -> Result<bool> {
            Ok(false)
        }
        async fn delete_link(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }
        async fn delete_combination_memberships(&self, _link_id: &str) -> Result<u64> {
            Ok(0)
        }
    }

    async fn seeded_db() -> Result<(tempfile::TempDir, Arc<LinkDatabase>)> {
        let dir = tempdir()?;
        let db = Arc::new(LinkDatabase::open(&dir.path().join("links.db")).await?);
        db.insert_link(&new_link("keep-1", "https://www.youtube.com/watch?v=aaaaaaaaaaa"))
            .await?;
        db.insert_link(&new_link("gone", "https://youtu.be/bbbbbbbbbbb"))
            .await?;
        db.insert_link(&new_link("keep-2", "https://youtube.com/embed/ccccccccccc"))
            .await?;
        db.insert_combination("mix", "Focus", "tester").await?;
        for id in ["keep-1", "gone", "keep-2"] {
            db.add_to_combination("mix", id).await?;
        }
        Ok((dir, db))
    }

    #[tokio::test]
    async fn removes_exactly_the_missing_link_and_its_memberships() -> Result<()> {
        let (_dir, db) = seeded_db().await?;
        let checker = Arc::new(ScriptedChecker::with(&[(
            "bbbbbbbbbbb",
            AvailabilityOutcome::NotFound,
        )]));
        let sweeper = AvailabilitySweeper::new(db.clone(), checker.clone(), CheckFailurePolicy::Skip);

        let report = sweeper.sweep().await?;
        assert_eq!(report.checked, 3);
        assert_eq!(report.removed, 1);
        assert_eq!(report.not_found, 1);
        assert_eq!(checker.seen.lock().len(), 3);

        assert!(db.get_link("gone").await?.is_none());
        assert!(db.get_link("keep-1").await?.is_some());
        assert!(db.get_link("keep-2").await?.is_some());
        assert_eq!(db.combination_members("mix").await?, vec!["keep-1", "keep-2"]);

        // Running again changes nothing.
        let again = sweeper.sweep().await?;
        assert_eq!(again.removed, 0);
        assert_eq!(again.checked, 2);
        Ok(())
    }

    #[tokio::test]
    async fn other_failures_also_remove() -> Result<()> {
        let (_dir, db) = seeded_db().await?;
        let checker = Arc::new(ScriptedChecker::with(&[(
            "aaaaaaaaaaa",
            AvailabilityOutcome::Unavailable(401),
        )]));
        let report = AvailabilitySweeper::new(db.clone(), checker, CheckFailurePolicy::Skip)
            .sweep()
            .await?;
        assert_eq!(report.unavailable, 1);
        assert!(db.get_link("keep-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failed_checks_follow_the_policy() -> Result<()> {
        let outcomes = [(
            "ccccccccccc",
            AvailabilityOutcome::CheckFailed("timed out".into()),
        )];

        let (_dir, db) = seeded_db().await?;
        let report = AvailabilitySweeper::new(
            db.clone(),
            Arc::new(ScriptedChecker::with(&outcomes)),
            CheckFailurePolicy::Skip,
        )
        .sweep()
        .await?;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.removed, 0);
        assert!(db.get_link("keep-2").await?.is_some());

        let report = AvailabilitySweeper::new(
            db.clone(),
            Arc::new(ScriptedChecker::with(&outcomes)),
            CheckFailurePolicy::Remove,
        )
        .sweep()
        .await?;
        assert_eq!(report.removed, 1);
        assert!(db.get_link("keep-2").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn links_without_a_video_id_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let db = Arc::new(LinkDatabase::open(&dir.path().join("links.db")).await?);
        db.insert_link(&new_link("channel", "https://www.youtube.com/@lofigirl"))
            .await?;
        let checker = Arc::new(ScriptedChecker::default());
        let report = AvailabilitySweeper::new(db.clone(), checker.clone(), CheckFailurePolicy::Remove)
            .sweep()
            .await?;
        assert_eq!(report.skipped, 1);
        assert!(checker.seen.lock().is_empty());
        assert!(db.get_link("channel").await?.is_some());
        Ok(())
    }

    /// Delegates to a real database but refuses to delete one link.
    struct StubbornStore {
        inner: Arc<LinkDatabase>,
        stuck: &'static str,
    }

    #[async_trait]
    impl LinkStore for StubbornStore {
        async fn list_links(&self, filter: &LinkFilter) -> Result<Vec<LinkItem>> {
            self.inner.list_links(filter).await
        }
        async fn update_link(&self, id: &str, patch: &crate::store::LinkPatch) -> Result<bool> {
            self.inner.update_link(id, patch).await
        }
        async fn delete_link(&self, id: &str) -> Result<bool> {
            if id == self.stuck {
                anyhow::bail!("row is locked");
            }
            self.inner.delete_link(id).await
        }
        async fn delete_combination_memberships(&self, link_id: &str) -> Result<u64> {
            self.inner.delete_combination_memberships(link_id).await
        }
    }

    #[tokio::test]
    async fn one_failed_removal_does_not_stop_the_sweep() -> Result<()> {
        let (_dir, db) = seeded_db().await?;
        let store = Arc::new(StubbornStore {
            inner: db.clone(),
            stuck: "keep-1",
        });
        let checker = Arc::new(ScriptedChecker::with(&[
            ("aaaaaaaaaaa", AvailabilityOutcome::NotFound),
            ("ccccccccccc", AvailabilityOutcome::NotFound),
        ]));
        let report = AvailabilitySweeper::new(store, checker, CheckFailurePolicy::Skip)
            .sweep()
            .await?;
        assert_eq!(report.errors, 1);
        assert_eq!(report.removed, 1);
        assert!(db.get_link("keep-1").await?.is_some());
        assert!(db.get_link("keep-2").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_sweep() {
        let sweeper = AvailabilitySweeper::new(
            Arc::new(BrokenStore),
            Arc::new(ScriptedChecker::default()),
            CheckFailurePolicy::Skip,
        );
        assert!(sweeper.sweep().await.is_err());
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(CheckFailurePolicy::parse(" Remove "), Some(CheckFailurePolicy::Remove));
        assert_eq!(CheckFailurePolicy::parse("skip"), Some(CheckFailurePolicy::Skip));
        assert_eq!(CheckFailurePolicy::parse("maybe"), None);
    }
}
