#![forbid(unsafe_code)]

//! Third-party endpoints: display metadata (batch + single) and the
//! per-video availability check.
//!
//! The HTTP implementations use a blocking `ureq` agent and hop onto the
//! blocking pool for every request so the async callers never stall.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::ProviderRef;
use crate::error::ProviderError;

/// Upper bound on ids per YouTube Data API `videos` call.
pub const YOUTUBE_BATCH_LIMIT: usize = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Looks up up to [`YOUTUBE_BATCH_LIMIT`] YouTube video ids in one call.
    ///
    /// Ids the provider does not know are simply absent from the map. Any
    /// non-2xx answer fails the whole batch.
    async fn fetch_batch(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, ProviderMetadata>, ProviderError>;

    /// Looks up one item of any provider. `Ok(None)` means "no title
    /// available".
    async fn fetch_single(
        &self,
        reference: &ProviderRef,
    ) -> Result<Option<ProviderMetadata>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityOutcome {
    Available,
    /// The provider answered 404.
    NotFound,
    /// Any other non-success HTTP status.
    Unavailable(u16),
    /// No HTTP answer at all (transport error, timeout).
    CheckFailed(String),
}

#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn check(&self, video_id: &str) -> AvailabilityOutcome;
}

/// Base URLs of every endpoint we talk to. Overridable for tests.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub youtube_videos: String,
    pub youtube_oembed: String,
    pub spotify_oembed: String,
    pub soundcloud_oembed: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            youtube_videos: "https://www.googleapis.com/youtube/v3/videos".into(),
            youtube_oembed: "https://www.youtube.com/oembed".into(),
            spotify_oembed: "https://open.spotify.com/oembed".into(),
            soundcloud_oembed: "https://soundcloud.com/oembed".into(),
        }
    }
}

impl ProviderEndpoints {
    /// Every endpoint rooted at `base` (e.g. `http://127.0.0.1:4010`).
    pub fn rooted_at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            youtube_videos: format!("{base}/youtube/v3/videos"),
            youtube_oembed: format!("{base}/youtube/oembed"),
            spotify_oembed: format!("{base}/spotify/oembed"),
            soundcloud_oembed: format!("{base}/soundcloud/oembed"),
        }
    }
}

impl From<ureq::Error> for ProviderError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Self::Status(code),
            ureq::Error::Transport(transport) => Self::Transport(transport.to_string()),
        }
    }
}

fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build()
}

/// Issues a GET on the blocking pool and decodes the JSON body.
async fn get_json<T>(
    agent: &ureq::Agent,
    url: &str,
    query: Vec<(&'static str, String)>,
) -> Result<T, ProviderError>
where
    T: DeserializeOwned + Send + 'static,
{
    let agent = agent.clone();
    let url = url.to_owned();
    tokio::task::spawn_blocking(move || {
        let mut request = agent.get(&url);
        for (name, value) in &query {
            request = request.query(name, value);
        }
        let response = request.call()?;
        response
            .into_json::<T>()
            .map_err(|err| ProviderError::Decode(err.to_string()))
    })
    .await
    .map_err(|err| ProviderError::Task(err.to_string()))?
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    snippet: VideoSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    #[serde(default)]
    channel_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
}

impl OEmbedResponse {
    fn into_metadata(self) -> Option<ProviderMetadata> {
        let title = self.title.filter(|title| !title.trim().is_empty())?;
        Some(ProviderMetadata {
            title,
            channel: self.author_name,
        })
    }
}

/// Metadata over the YouTube Data API (batch) and provider oEmbed endpoints
/// (single item).
pub struct HttpMetadataProvider {
    agent: ureq::Agent,
    endpoints: ProviderEndpoints,
    youtube_api_key: Option<String>,
}

impl HttpMetadataProvider {
    pub fn new(youtube_api_key: Option<String>) -> Self {
        Self::with_endpoints(youtube_api_key, ProviderEndpoints::default())
    }

    pub fn with_endpoints(youtube_api_key: Option<String>, endpoints: ProviderEndpoints) -> Self {
        Self {
            agent: build_agent(),
            endpoints,
            youtube_api_key: youtube_api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    fn oembed_target(&self, reference: &ProviderRef) -> Option<(String, Vec<(&'static str, String)>)> {
        match reference {
            ProviderRef::YouTube { video_id } => Some((
                self.endpoints.youtube_oembed.clone(),
                vec![
                    ("url", youtube_watch_url(video_id)),
                    ("format", "json".into()),
                ],
            )),
            ProviderRef::Spotify { kind, id } => Some((
                self.endpoints.spotify_oembed.clone(),
                vec![("url", format!("https://open.spotify.com/{kind}/{id}"))],
            )),
            ProviderRef::SoundCloud { url, .. } => Some((
                self.endpoints.soundcloud_oembed.clone(),
                vec![("format", "json".into()), ("url", url.clone())],
            )),
            ProviderRef::Malformed { .. } | ProviderRef::Unsupported => None,
        }
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    async fn fetch_batch(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, ProviderMetadata>, ProviderError> {
        if video_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let key = self
            .youtube_api_key
            .clone()
            .ok_or(ProviderError::MissingApiKey("youtube"))?;

        debug!("fetching metadata for {} youtube ids", video_ids.len());
        let response: VideoListResponse = get_json(
            &self.agent,
            &self.endpoints.youtube_videos,
            vec![
                ("part", "snippet".into()),
                ("id", video_ids.join(",")),
                ("key", key),
            ],
        )
        .await?;

        Ok(response
            .items
            .into_iter()
            .map(|item| {
                let metadata = ProviderMetadata {
                    title: item.snippet.title,
                    channel: item.snippet.channel_title,
                };
                (item.id, metadata)
            })
            .collect())
    }

    async fn fetch_single(
        &self,
        reference: &ProviderRef,
    ) -> Result<Option<ProviderMetadata>, ProviderError> {
        let Some((endpoint, query)) = self.oembed_target(reference) else {
            return Ok(None);
        };
        match get_json::<OEmbedResponse>(&self.agent, &endpoint, query).await {
            Ok(response) => Ok(response.into_metadata()),
            Err(ProviderError::Status(404)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Availability via YouTube's oEmbed endpoint: 2xx means the video is still
/// public and embeddable.
pub struct OEmbedAvailabilityChecker {
    agent: ureq::Agent,
    endpoint: String,
}

impl Default for OEmbedAvailabilityChecker {
    fn default() -> Self {
        Self::with_endpoint(ProviderEndpoints::default().youtube_oembed)
    }
}

impl OEmbedAvailabilityChecker {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            agent: build_agent(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AvailabilityChecker for OEmbedAvailabilityChecker {
    async fn check(&self, video_id: &str) -> AvailabilityOutcome {
        let query = vec![
            ("url", youtube_watch_url(video_id)),
            ("format", "json".into()),
        ];
        match get_json::<serde_json::Value>(&self.agent, &self.endpoint, query).await {
            Ok(_) => AvailabilityOutcome::Available,
            Err(ProviderError::Status(404)) => AvailabilityOutcome::NotFound,
            Err(ProviderError::Status(code)) => AvailabilityOutcome::Unavailable(code),
            // A 2xx with an unexpected body still proves the video exists.
            Err(ProviderError::Decode(_)) => AvailabilityOutcome::Available,
            Err(err) => AvailabilityOutcome::CheckFailed(err.to_string()),
        }
    }
}

pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}
