#![forbid(unsafe_code)]

//! Wiring shared by the binaries: logging setup and the service graph built
//! from [`RuntimeSettings`].

use std::{fs, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeSettings;
use crate::embed_cache::EmbedContentCache;
use crate::metadata_cache::{DEFAULT_METADATA_TTL_HOURS, MetadataCache};
use crate::providers::{HttpMetadataProvider, OEmbedAvailabilityChecker};
use crate::resolver::{EmbedResolver, ResolverConfig};
use crate::storage::JsonFileStorage;
use crate::store::LinkDatabase;
use crate::sweeper::AvailabilitySweeper;
use crate::titles::{TitleBackfill, TitleFetcher};

/// Delay before the start-up metadata cleanup runs.
pub const INITIAL_CLEANUP_DELAY: Duration = Duration::from_millis(1500);

const DEFAULT_LOG_DIRECTIVE: &str = "studybeats_tools=info";

/// Installs the global subscriber. `RUST_LOG` replaces the default directive.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[derive(Clone)]
pub struct Services {
    pub store: Arc<LinkDatabase>,
    pub metadata: Arc<MetadataCache>,
    pub resolver: Arc<EmbedResolver>,
    pub sweeper: Arc<AvailabilitySweeper>,
    pub backfill: Arc<TitleBackfill>,
}

impl Services {
    pub async fn open(settings: &RuntimeSettings) -> Result<Self> {
        fs::create_dir_all(&settings.data_root).with_context(|| {
            format!("creating data root {}", settings.data_root.display())
        })?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(
            LinkDatabase::open(&settings.links_db_path())
                .await
                .context("opening link database")?,
        );

        let storage = Arc::new(JsonFileStorage::open(
            settings.metadata_cache_path(),
            Some(settings.metadata_cache_quota_bytes),
        ));
        let metadata = Arc::new(MetadataCache::with_limits(
            storage,
            Arc::clone(&clock),
            chrono::Duration::hours(DEFAULT_METADATA_TTL_HOURS),
            settings.metadata_cache_capacity,
        ));

        let provider = Arc::new(HttpMetadataProvider::new(settings.youtube_api_key.clone()));
        let fetcher = TitleFetcher::new(provider, Arc::clone(&metadata));

        let resolver = Arc::new(EmbedResolver::new(
            Arc::new(EmbedContentCache::new(Arc::clone(&clock))),
            fetcher.clone(),
            ResolverConfig {
                origin: settings.embed_origin.clone(),
                ..ResolverConfig::default()
            },
        ));
        let sweeper = Arc::new(AvailabilitySweeper::new(
            store.clone(),
            Arc::new(OEmbedAvailabilityChecker::default()),
            settings.check_failure_policy,
        ));
        let backfill = Arc::new(TitleBackfill::new(store.clone(), fetcher, clock));

        info!(
            "services ready (data root {}, metadata cache {} entries, sweep policy {})",
            settings.data_root.display(),
            metadata.len(),
            settings.check_failure_policy
        );

        Ok(Self {
            store,
            metadata,
            resolver,
            sweeper,
            backfill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use crate::store::LinkFilter;
    use crate::store::LinkStore;
    use crate::sweeper::CheckFailurePolicy;
    use tempfile::tempdir;

    fn settings_in(root: &std::path::Path) -> RuntimeSettings {
        RuntimeSettings {
            data_root: root.join("nested").join("data"),
            host: "127.0.0.1".into(),
            port: 0,
            sweep_secret: None,
            sweep_interval_hours: 0,
            check_failure_policy: CheckFailurePolicy::Skip,
            youtube_api_key: None,
            embed_origin: Some("https://beats.example".into()),
            metadata_cache_capacity: 10,
            metadata_cache_quota_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn open_creates_data_root_and_empty_store() -> Result<()> {
        let temp = tempdir()?;
        let settings = settings_in(temp.path());
        let services = Services::open(&settings).await?;

        assert!(settings.data_root.is_dir());
        assert!(settings.links_db_path().exists());
        assert!(services.store.list_links(&LinkFilter::All).await?.is_empty());
        assert_eq!(services.metadata.capacity(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn resolver_uses_configured_origin() -> Result<()> {
        let temp = tempdir()?;
        let services = Services::open(&settings_in(temp.path())).await?;
        let resolution = services
            .resolver
            .resolve("https://www.youtube.com/watch?v=dQw4w9WgXcQ", None)
            .await;
        let frame = resolution
            .descriptor
            .and_then(|descriptor| descriptor.frame_url)
            .unwrap();
        assert!(frame.contains("origin=https%3A%2F%2Fbeats.example"));
        Ok(())
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
