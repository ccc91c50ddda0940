#![forbid(unsafe_code)]

//! Error taxonomy shared by the caches, the resolver and the sweeper.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an embed could not be produced (or could only be produced partially).
///
/// The resolver never returns these as `Err`; they travel inside the
/// resolution so the UI can pick the matching fallback card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedErrorKind {
    /// The URL does not belong to any supported provider.
    #[error("unsupported content")]
    UnsupportedFormat,
    /// The provider was recognized but no usable id could be extracted.
    #[error("could not extract a media id")]
    ParseFailed,
    /// Network failure or non-2xx answer from a provider endpoint.
    #[error("provider request failed")]
    FetchFailed,
    /// The persistent cache refused a write.
    #[error("cache storage failed")]
    StorageFailure,
    /// The frame itself failed to load on the client (ad-blocker, CSP, ...).
    #[error("embed was blocked while rendering")]
    RenderBlocked,
}

/// Failures of the persistent key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded ({needed} bytes needed, {quota} allowed)")]
    QuotaExceeded { needed: usize, quota: usize },
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures talking to third-party metadata or availability endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider answered with HTTP {0}")]
    Status(u16),
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("no API key configured for {0}")]
    MissingApiKey(&'static str),
    #[error("provider task aborted: {0}")]
    Task(String),
}
