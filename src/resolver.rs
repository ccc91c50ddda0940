#![forbid(unsafe_code)]

//! Turns a raw link URL into a renderable embed descriptor.
//!
//! Flow: classify, consult the embed content cache, otherwise run one
//! deduplicated resolution per URL and title need that derives the frame and
//! thumbnail URLs and (only when the caller lacks a usable title) looks the
//! title up through the metadata cache and provider. Every outcome, including failures, is
//! cached for the content-cache TTL. Failures are reported inside the
//! [`Resolution`], never as `Err`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::classify::{Provider, ProviderRef, classify};
use crate::dedupe::RequestDeduplicator;
use crate::embed_cache::{EmbedContentCache, EmbedDescriptor};
use crate::error::EmbedErrorKind;
use crate::titles::{TitleFetcher, is_missing_title};

/// YouTube still-image sizes, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailQuality {
    Default,
    Mq,
    #[default]
    Hq,
    Sd,
    MaxRes,
}

impl ThumbnailQuality {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Mq => "mqdefault",
            Self::Hq => "hqdefault",
            Self::Sd => "sddefault",
            Self::MaxRes => "maxresdefault",
        }
    }
}

pub fn youtube_thumbnail_url(video_id: &str, quality: ThumbnailQuality) -> String {
    format!(
        "https://img.youtube.com/vi/{video_id}/{}.jpg",
        quality.file_name()
    )
}

/// Frame URL for a classified link. `origin` is only used by YouTube.
pub fn frame_url(reference: &ProviderRef, origin: Option<&str>) -> Option<String> {
    match reference {
        ProviderRef::YouTube { video_id } => {
            let mut query = form_urlencoded::Serializer::new(String::new());
            query.append_pair("enablejsapi", "1");
            query.append_pair("rel", "0");
            if let Some(origin) = origin.map(str::trim).filter(|o| !o.is_empty()) {
                query.append_pair("origin", origin);
            }
            Some(format!(
                "https://www.youtube.com/embed/{video_id}?{}",
                query.finish()
            ))
        }
        ProviderRef::Spotify { kind, id } => {
            Some(format!("https://open.spotify.com/embed/{kind}/{id}"))
        }
        ProviderRef::SoundCloud { url, .. } => {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("url", url)
                .append_pair("auto_play", "false")
                .append_pair("visual", "true")
                .finish();
            Some(format!("https://w.soundcloud.com/player/?{query}"))
        }
        ProviderRef::Malformed { .. } | ProviderRef::Unsupported => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Page origin passed to the YouTube player.
    pub origin: Option<String>,
    pub thumbnail_quality: ThumbnailQuality,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Provider the caller believes the link belongs to. Classification wins
    /// when they disagree.
    pub provider_hint: Option<Provider>,
    /// The caller will display a title for this link.
    pub needs_title: bool,
    /// Title currently stored on the link, if any.
    pub current_title: Option<String>,
}

impl ResolveOptions {
    fn wants_title_lookup(&self) -> bool {
        self.needs_title
            && self
                .current_title
                .as_deref()
                .is_none_or(is_missing_title)
    }
}

/// What the UI renders for one link at a given moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub descriptor: Option<EmbedDescriptor>,
    pub is_loading: bool,
    pub error_kind: Option<EmbedErrorKind>,
    pub thumbnail_url: Option<String>,
}

impl Resolution {
    pub fn loading() -> Self {
        Self {
            descriptor: None,
            is_loading: true,
            error_kind: None,
            thumbnail_url: None,
        }
    }

    pub fn settled(descriptor: EmbedDescriptor) -> Self {
        Self {
            error_kind: descriptor.error,
            thumbnail_url: descriptor.thumbnail_url.clone(),
            descriptor: Some(descriptor),
            is_loading: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }
}

pub struct EmbedResolver {
    content_cache: Arc<EmbedContentCache>,
    titles: TitleFetcher,
    inflight: RequestDeduplicator<EmbedDescriptor>,
    config: ResolverConfig,
}

impl EmbedResolver {
    pub fn new(content_cache: Arc<EmbedContentCache>, titles: TitleFetcher, config: ResolverConfig) -> Self {
        Self {
            content_cache,
            titles,
            inflight: RequestDeduplicator::new(),
            config,
        }
    }

    pub fn content_cache(&self) -> &Arc<EmbedContentCache> {
        &self.content_cache
    }

    pub async fn resolve(&self, url: &str, provider_hint: Option<Provider>) -> Resolution {
        let options = ResolveOptions {
            provider_hint,
            ..ResolveOptions::default()
        };
        self.resolve_with(url, &options).await
    }

    /// Resolves `url`. Concurrent calls for the same URL and title need share
    /// a single resolution.
    pub async fn resolve_with(&self, url: &str, options: &ResolveOptions) -> Resolution {
        let reference = classify(url);
        if let Some(hint) = options.provider_hint
            && reference.is_supported()
            && hint != reference.provider()
        {
            debug!(
                "provider hint {hint} disagrees with classified {} for {url}",
                reference.provider()
            );
        }

        match &reference {
            ProviderRef::Unsupported => {
                return Resolution::settled(EmbedDescriptor::failed(
                    url,
                    Provider::Unsupported,
                    EmbedErrorKind::UnsupportedFormat,
                ));
            }
            ProviderRef::Malformed { recognized } => {
                return Resolution::settled(EmbedDescriptor::failed(
                    url,
                    *recognized,
                    EmbedErrorKind::ParseFailed,
                ));
            }
            _ => {}
        }

        let wants_title = options.wants_title_lookup();
        if let Some(descriptor) = self.cached_descriptor(url, wants_title) {
            debug!("embed cache hit: {url}");
            return Resolution::settled(descriptor);
        }

        let key = entry_key(url, wants_title);
        let outcome = self
            .inflight
            .dedupe(&key, || {
                build_descriptor(
                    url.to_owned(),
                    key.clone(),
                    reference.clone(),
                    wants_title,
                    self.titles.clone(),
                    Arc::clone(&self.content_cache),
                    self.config.clone(),
                )
            })
            .await;

        match outcome {
            Ok(descriptor) => Resolution::settled(descriptor),
            Err(err) => {
                warn!("embed resolution for {url} aborted: {err}");
                Resolution::settled(EmbedDescriptor::failed(
                    url,
                    reference.provider(),
                    EmbedErrorKind::FetchFailed,
                ))
            }
        }
    }

    /// A titled entry serves every caller; an untitled one only serves callers
    /// that do not want a title.
    fn cached_descriptor(&self, url: &str, wants_title: bool) -> Option<EmbedDescriptor> {
        self.content_cache.get_embed(&entry_key(url, true)).or_else(|| {
            (!wants_title)
                .then(|| self.content_cache.get_embed(&entry_key(url, false)))
                .flatten()
        })
    }
}

/// Content-cache and in-flight key. Resolutions that looked the title up are
/// stored under the bare URL.
fn entry_key(url: &str, wants_title: bool) -> String {
    if wants_title {
        url.to_owned()
    } else {
        format!("{url}{UNTITLED_SUFFIX}")
    }
}

const UNTITLED_SUFFIX: &str = "\u{1f}untitled";

async fn build_descriptor(
    url: String,
    key: String,
    reference: ProviderRef,
    wants_title: bool,
    titles: TitleFetcher,
    content_cache: Arc<EmbedContentCache>,
    config: ResolverConfig,
) -> EmbedDescriptor {
    let mut descriptor = EmbedDescriptor {
        url: url.clone(),
        provider: reference.provider(),
        frame_url: frame_url(&reference, config.origin.as_deref()),
        thumbnail_url: match &reference {
            ProviderRef::YouTube { video_id } => {
                Some(youtube_thumbnail_url(video_id, config.thumbnail_quality))
            }
            _ => None,
        },
        title: None,
        channel: None,
        error: None,
    };

    if wants_title {
        match titles.fetch_title(&reference).await {
            Ok(Some(metadata)) => {
                descriptor.title = Some(metadata.title);
                descriptor.channel = metadata.channel;
            }
            Ok(None) => debug!("no title available for {url}"),
            Err(err) => {
                warn!("title lookup for {url} failed: {err}");
                descriptor.error = Some(EmbedErrorKind::FetchFailed);
            }
        }
    }

    content_cache.set_embed(&key, descriptor.clone());
    descriptor
}
