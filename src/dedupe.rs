#![forbid(unsafe_code)]

//! At most one in-flight unit of work per key.
//!
//! The first caller for a key starts the work on the runtime; later callers
//! for the same key await the same shared outcome. The work is spawned, so
//! it runs to completion (and populates whatever caches it writes) even when
//! every caller has gone away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DedupeError {
    #[error("deduplicated task panicked")]
    Panicked,
    #[error("deduplicated task was cancelled")]
    Cancelled,
}

impl From<JoinError> for DedupeError {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            Self::Panicked
        } else {
            Self::Cancelled
        }
    }
}

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, DedupeError>>>;

struct Pending<T> {
    ticket: u64,
    outcome: SharedOutcome<T>,
}

type Registry<T> = Arc<Mutex<HashMap<String, Pending<T>>>>;

pub struct RequestDeduplicator<T> {
    pending: Registry<T>,
    next_ticket: AtomicU64,
}

impl<T> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `factory` unless work for `key` is already in flight, in which
    /// case the pending outcome is shared instead.
    ///
    /// `factory` is invoked while the registry is locked; it should only build
    /// the future, not do work. Failures inside the work belong in `T`
    /// (typically a `Result`); `DedupeError` only reports a panic or a
    /// runtime shutdown.
    pub async fn dedupe<F, Fut>(&self, key: &str, factory: F) -> Result<T, DedupeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let outcome = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(existing) => {
                    debug!("joining in-flight request for {key}");
                    existing.outcome.clone()
                }
                None => {
                    let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.launch(key, ticket, factory());
                    pending.insert(
                        key.to_owned(),
                        Pending {
                            ticket,
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };
        outcome.await
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    fn launch<Fut>(&self, key: &str, ticket: u64, work: Fut) -> SharedOutcome<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let settle = Settle {
            registry: Arc::clone(&self.pending),
            key: key.to_owned(),
            ticket,
        };
        let handle = tokio::spawn(async move {
            // Dropped on completion, panic or abort; always before the join
            // handle yields, so awaiting callers never see a stale entry.
            let _settle = settle;
            work.await
        });
        handle
            .map(|joined| joined.map_err(DedupeError::from))
            .boxed()
            .shared()
    }
}

/// Removes the registry entry for `key` when dropped, unless a newer
/// request has already taken the slot.
struct Settle<T> {
    registry: Registry<T>,
    key: String,
    ticket: u64,
}

impl<T> Drop for Settle<T> {
    fn drop(&mut self) {
        let mut pending = self.registry.lock();
        if pending
            .get(&self.key)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            pending.remove(&self.key);
        }
    }
}
