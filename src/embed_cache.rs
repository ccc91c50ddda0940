#![forbid(unsafe_code)]

//! Short-lived, process-local cache of resolved embed descriptors keyed by
//! the full link URL. Nothing here survives a restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::Provider;
use crate::clock::Clock;
use crate::error::EmbedErrorKind;

pub const DEFAULT_EMBED_TTL_MINUTES: i64 = 5;

/// Renderable form of one link.
///
/// `error` is set when the embed could not be fully produced. A descriptor
/// may carry both a frame URL and an error (the frame is playable but the
/// title lookup failed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedDescriptor {
    pub url: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EmbedErrorKind>,
}

impl EmbedDescriptor {
    pub fn failed(url: &str, provider: Provider, kind: EmbedErrorKind) -> Self {
        Self {
            url: url.to_owned(),
            provider,
            frame_url: None,
            thumbnail_url: None,
            title: None,
            channel: None,
            error: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
struct CachedEmbed {
    descriptor: EmbedDescriptor,
    cached_at: DateTime<Utc>,
}

pub struct EmbedContentCache {
    entries: RwLock<HashMap<String, CachedEmbed>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl EmbedContentCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, Duration::minutes(DEFAULT_EMBED_TTL_MINUTES))
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    pub fn get_embed(&self, url: &str) -> Option<EmbedDescriptor> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(url) {
                None => return None,
                Some(entry) if now - entry.cached_at < self.ttl => {
                    return Some(entry.descriptor.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: drop it unless another writer refreshed it meanwhile.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(url)
            && now - entry.cached_at >= self.ttl
        {
            debug!("embed cache expired: {url}");
            entries.remove(url);
        }
        None
    }

    pub fn set_embed(&self, url: &str, descriptor: EmbedDescriptor) {
        let entry = CachedEmbed {
            descriptor,
            cached_at: self.clock.now(),
        };
        self.entries.write().insert(url.to_owned(), entry);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
