#![forbid(unsafe_code)]

//! Small string key-value storage contract backing the metadata cache.
//!
//! Mirrors what a browser's local storage offers: string values, key
//! enumeration and writes that may fail once a byte quota is exhausted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::StorageError;

pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str);
    fn keys(&self) -> Vec<String>;

    /// Removes several keys at once. Backends that persist should override
    /// this to write once for the whole batch.
    fn remove_items(&self, keys: &[String]) {
        for key in keys {
            self.remove_item(key);
        }
    }
}

fn footprint(entries: &BTreeMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// Byte usage after replacing (or adding) `key` with `value`.
fn footprint_after(entries: &BTreeMap<String, String>, key: &str, value: &str) -> usize {
    let current = footprint(entries);
    let replaced = entries.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
    current - replaced + key.len() + value.len()
}

fn check_quota(quota: Option<usize>, needed: usize) -> Result<(), StorageError> {
    match quota {
        Some(quota) if needed > quota => Err(StorageError::QuotaExceeded { needed, quota }),
        _ => Ok(()),
    }
}

/// Process-local storage. Used in tests and as the fallback when no data
/// directory is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            quota: Some(quota),
        }
    }

    pub fn bytes_used(&self) -> usize {
        footprint(&self.entries.read())
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        check_quota(self.quota, footprint_after(&entries, key, value))?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn remove_items(&self, keys: &[String]) {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Storage persisted as a single JSON object on disk.
///
/// Every successful write rewrites the file through a temp file + rename, so
/// a crash never leaves a half-written document behind.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl JsonFileStorage {
    /// Loads the file if it exists. A corrupt file is discarded: the data is
    /// a cache and rebuilding it is always safe.
    pub fn open(path: impl Into<PathBuf>, quota: Option<usize>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("discarding unreadable cache file {}: {err}", path.display());
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: RwLock::new(entries),
            quota,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        write_json_atomic(&self.path, entries)
    }
}

impl KeyValueStorage for JsonFileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        check_quota(self.quota, footprint_after(&entries, key, value))?;
        let previous = entries.insert(key.to_owned(), value.to_owned());
        if let Err(err) = self.persist(&entries) {
            // Roll back so memory and disk stay in step.
            match previous {
                Some(old) => entries.insert(key.to_owned(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some()
            && let Err(err) = self.persist(&entries)
        {
            warn!("failed to persist removal of {key}: {err}");
        }
    }

    fn remove_items(&self, keys: &[String]) {
        let mut entries = self.entries.write();
        let removed = keys
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some())
            .count();
        if removed > 0
            && let Err(err) = self.persist(&entries)
        {
            warn!("failed to persist removal of {removed} entries: {err}");
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

fn write_json_atomic(path: &Path, value: &BTreeMap<String, String>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec(value)?;
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
