#![forbid(unsafe_code)]

//! Persistent, TTL-bounded cache of display metadata (title + channel).
//!
//! Entries live in a [`KeyValueStorage`] under a common prefix, one JSON
//! document per `(provider, externalId)` key. Expired entries are treated as
//! absent and removed lazily; the cache is capped at a soft capacity and
//! sheds its oldest fifth when full.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::storage::KeyValueStorage;

pub const DEFAULT_METADATA_TTL_HOURS: i64 = 24;
pub const DEFAULT_METADATA_CAPACITY: usize = 500;
/// Share of entries dropped when the cache is full.
pub const EVICTION_FRACTION: f64 = 0.2;

const KEY_PREFIX: &str = "studybeats.meta.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub external_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub cached_at: DateTime<Utc>,
}

pub struct MetadataCache {
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
    // Serializes count/evict/insert so two writers cannot both skip eviction.
    write_lock: Mutex<()>,
}

impl MetadataCache {
    pub fn new(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(
            storage,
            clock,
            Duration::hours(DEFAULT_METADATA_TTL_HOURS),
            DEFAULT_METADATA_CAPACITY,
        )
    }

    pub fn with_limits(
        storage: Arc<dyn KeyValueStorage>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            storage,
            clock,
            ttl,
            capacity: capacity.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the live entry for `key`, evicting it if it has expired or
    /// cannot be decoded.
    pub fn get(&self, key: &str) -> Option<MetadataEntry> {
        let storage_key = storage_key(key);
        let raw = self.storage.get_item(&storage_key)?;
        if let Some(entry) = self.live_entry(&raw) {
            return Some(entry);
        }

        // Stale: drop it unless a writer refreshed it meanwhile.
        let _guard = self.write_lock.lock();
        let raw = self.storage.get_item(&storage_key)?;
        if let Some(entry) = self.live_entry(&raw) {
            return Some(entry);
        }
        debug!("metadata cache expired: {key}");
        self.storage.remove_item(&storage_key);
        None
    }

    /// Stores `title`/`channel` under `key`, overwriting any previous value.
    ///
    /// A failed write is logged and followed by a [`cleanup`](Self::cleanup)
    /// pass to reclaim space; the error is returned for callers that care but
    /// must never abort the surrounding work.
    pub fn set(&self, key: &str, title: &str, channel: Option<&str>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let storage_key = storage_key(key);

        if self.storage.get_item(&storage_key).is_none() {
            let count = self.cached_keys().len();
            if count >= self.capacity {
                self.evict_oldest(count);
            }
        }

        let entry = MetadataEntry {
            external_id: key.to_owned(),
            title: title.to_owned(),
            channel: channel.map(str::to_owned),
            cached_at: self.clock.now(),
        };
        let payload = serde_json::to_string(&entry)?;
        if let Err(err) = self.storage.set_item(&storage_key, &payload) {
            warn!("metadata cache write failed for {key}: {err}");
            self.cleanup();
            return Err(err);
        }
        Ok(())
    }

    /// Removes every expired or unreadable entry. Returns how many went away.
    pub fn cleanup(&self) -> usize {
        let stale: Vec<String> = self
            .cached_keys()
            .into_iter()
            .filter(|storage_key| {
                self.storage
                    .get_item(storage_key)
                    .is_some_and(|raw| self.live_entry(&raw).is_none())
            })
            .collect();
        if !stale.is_empty() {
            self.storage.remove_items(&stale);
            info!("metadata cache cleanup removed {} entries", stale.len());
        }
        stale.len()
    }

    /// Schedules the start-up cleanup slightly after construction so it does
    /// not compete with the first batch of lookups.
    pub fn spawn_initial_cleanup(self: &Arc<Self>, delay: std::time::Duration) -> JoinHandle<usize> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.cleanup()
        })
    }

    pub fn len(&self) -> usize {
        self.cached_keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_expired(&self, entry: &MetadataEntry) -> bool {
        self.clock.now() - entry.cached_at >= self.ttl
    }

    /// Decodes `raw`, or `None` when it is unreadable or expired.
    fn live_entry(&self, raw: &str) -> Option<MetadataEntry> {
        serde_json::from_str::<MetadataEntry>(raw)
            .ok()
            .filter(|entry| !self.is_expired(entry))
    }

    fn cached_keys(&self) -> Vec<String> {
        self.storage
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(KEY_PREFIX))
            .collect()
    }

    /// Drops the oldest `EVICTION_FRACTION` of `count` entries (at least one).
    /// Unreadable entries sort first.
    fn evict_oldest(&self, count: usize) {
        let target = ((count as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        let mut aged: Vec<(Option<DateTime<Utc>>, String)> = self
            .cached_keys()
            .into_iter()
            .map(|storage_key| {
                let cached_at = self
                    .storage
                    .get_item(&storage_key)
                    .and_then(|raw| serde_json::from_str::<MetadataEntry>(&raw).ok())
                    .map(|entry| entry.cached_at);
                (cached_at, storage_key)
            })
            .collect();
        aged.sort();

        let doomed: Vec<String> = aged
            .into_iter()
            .take(target)
            .map(|(_, storage_key)| storage_key)
            .collect();
        self.storage.remove_items(&doomed);
        debug!("metadata cache evicted {target} of {count} entries");
    }
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}
