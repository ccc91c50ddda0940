#![forbid(unsafe_code)]

//! Per-card lazy loading.
//!
//! A card does nothing until it first becomes visible (or the host cannot
//! observe visibility), then resolves its embed once. YouTube cards stop at a
//! thumbnail until the user clicks it; every other provider goes live as soon
//! as resolution succeeds. Frame load errors are handled here too: SoundCloud
//! frames get a bounded number of reloads, everything else falls back to an
//! external link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::classify::Provider;
use crate::error::EmbedErrorKind;
use crate::resolver::{EmbedResolver, ResolveOptions, Resolution};

/// Minimum visible fraction of the card that triggers resolution.
pub const VISIBILITY_THRESHOLD: f64 = 0.1;
/// Frame reloads granted to a SoundCloud player before giving up.
pub const SOUNDCLOUD_MAX_RELOADS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedStage {
    /// Not yet visible; nothing has been requested.
    Unresolved,
    Resolving,
    /// Resolved YouTube card showing its still image.
    Thumbnail,
    /// The frame is mounted.
    Live,
    /// Only an external link to the original URL is offered.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorAction {
    Reload { attempt: u32 },
    ShowExternalLink,
    /// No frame is mounted; nothing to do.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotState {
    pub stage: EmbedStage,
    pub resolution: Option<Resolution>,
    pub reloads: u32,
    pub frame_error: Option<EmbedErrorKind>,
}

pub struct LazyEmbed {
    url: String,
    options: ResolveOptions,
    resolver: Arc<EmbedResolver>,
    state: Arc<Mutex<SlotState>>,
    mounted: Arc<AtomicBool>,
    triggered: AtomicBool,
}

impl LazyEmbed {
    pub fn new(resolver: Arc<EmbedResolver>, url: impl Into<String>, options: ResolveOptions) -> Self {
        Self {
            url: url.into(),
            options,
            resolver,
            state: Arc::new(Mutex::new(SlotState {
                stage: EmbedStage::Unresolved,
                resolution: None,
                reloads: 0,
                frame_error: None,
            })),
            mounted: Arc::new(AtomicBool::new(true)),
            triggered: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stage(&self) -> EmbedStage {
        self.state.lock().stage
    }

    pub fn snapshot(&self) -> SlotState {
        self.state.lock().clone()
    }

    /// Feeds an intersection update. Starts resolution the first time at
    /// least [`VISIBILITY_THRESHOLD`] of the card is visible.
    pub fn on_visibility(&self, visible_ratio: f64) -> Option<JoinHandle<()>> {
        if visible_ratio.is_nan() || visible_ratio < VISIBILITY_THRESHOLD {
            return None;
        }
        self.trigger()
    }

    /// Used when the host has no way to observe visibility.
    pub fn observation_unsupported(&self) -> Option<JoinHandle<()>> {
        self.trigger()
    }

    /// The user clicked the thumbnail: mount the frame.
    pub fn on_thumbnail_click(&self) -> bool {
        let mut state = self.state.lock();
        if state.stage != EmbedStage::Thumbnail {
            return false;
        }
        state.stage = EmbedStage::Live;
        true
    }

    /// The mounted frame failed to load.
    pub fn on_frame_error(&self) -> FrameErrorAction {
        let mut state = self.state.lock();
        if state.stage != EmbedStage::Live {
            return FrameErrorAction::Ignored;
        }
        let provider = state
            .resolution
            .as_ref()
            .and_then(|resolution| resolution.descriptor.as_ref())
            .map(|descriptor| descriptor.provider);

        if provider == Some(Provider::SoundCloud) && state.reloads < SOUNDCLOUD_MAX_RELOADS {
            state.reloads += 1;
            debug!("reloading frame for {} (attempt {})", self.url, state.reloads);
            return FrameErrorAction::Reload {
                attempt: state.reloads,
            };
        }

        state.stage = EmbedStage::Fallback;
        state.frame_error = Some(EmbedErrorKind::RenderBlocked);
        FrameErrorAction::ShowExternalLink
    }

    /// The card is gone. A pending resolution still finishes and fills the
    /// shared caches, but its result is no longer applied here.
    pub fn detach(&self) {
        self.mounted.store(false, Ordering::SeqCst);
    }

    fn trigger(&self) -> Option<JoinHandle<()>> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return None;
        }
        {
            let mut state = self.state.lock();
            state.stage = EmbedStage::Resolving;
            state.resolution = Some(Resolution::loading());
        }

        let resolver = Arc::clone(&self.resolver);
        let state = Arc::clone(&self.state);
        let mounted = Arc::clone(&self.mounted);
        let url = self.url.clone();
        let options = self.options.clone();
        Some(tokio::spawn(async move {
            let resolution = resolver.resolve_with(&url, &options).await;
            if !mounted.load(Ordering::SeqCst) {
                debug!("card for {url} detached before resolution finished");
                return;
            }
            let mut state = state.lock();
            state.stage = stage_after(&resolution);
            state.resolution = Some(resolution);
        }))
    }
}

fn stage_after(resolution: &Resolution) -> EmbedStage {
    let Some(descriptor) = resolution.descriptor.as_ref() else {
        return EmbedStage::Fallback;
    };
    if descriptor.frame_url.is_none() {
        return EmbedStage::Fallback;
    }
    match descriptor.provider {
        Provider::YouTube => EmbedStage::Thumbnail,
        Provider::Spotify | Provider::SoundCloud => EmbedStage::Live,
        Provider::Unsupported => EmbedStage::Fallback,
    }
}
