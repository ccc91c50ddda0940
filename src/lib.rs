#![forbid(unsafe_code)]

//! Embed resolution, metadata caching and link maintenance for StudyBeats.

pub mod app;
pub mod classify;
pub mod clock;
pub mod config;
pub mod dedupe;
pub mod embed_cache;
pub mod error;
pub mod gate;
pub mod metadata_cache;
pub mod providers;
pub mod resolver;
pub mod security;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod titles;
