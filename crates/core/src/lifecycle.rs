//! C7 — Request Lifecycle.
//!
//! Binds every request to a `CancellationToken`, enforces a process-wide
//! concurrency limit via a `tokio::sync::Semaphore`, and implements the
//! per-client "cancel previous" channel: a new request on the same
//! cancel-key supersedes whatever was in flight there.

use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// How long a request waits for a concurrency slot before surfacing
/// `Busy` rather than queueing indefinitely.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

struct CancelEntry {
    token: CancellationToken,
    epoch: u64,
}

/// Holds the concurrency gate and the cancel-key registry. One instance is
/// constructed at process startup and shared across all requests.
pub struct Lifecycle {
    semaphore: Arc<Semaphore>,
    cancel_keys: DashMap<String, CancelEntry>,
    epoch: AtomicU64,
}

/// An admitted request: a live permit (dropped at end of scope to free the
/// concurrency slot) plus the token that governs this request's own
/// cancellation, whether from the cancel-key channel or an external signal.
pub struct RequestGuard {
    _permit: OwnedSemaphorePermit,
    pub cancel: CancellationToken,
    cancel_key_epoch: Option<u64>,
}

impl Lifecycle {
    pub fn new(concurrent_requests: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrent_requests.max(1))),
            cancel_keys: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    /// Admit a request: acquire a concurrency slot (timing out as `Busy`)
    /// and, if `cancel_key` is given, cancel whatever request previously
    /// held that key before registering a fresh token for this one.
    pub async fn begin(&self, cancel_key: Option<&str>) -> Result<RequestGuard> {
        let permit = tokio::time::timeout(QUEUE_TIMEOUT, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| EngineError::Busy)?
            .map_err(|_| EngineError::Busy)?;

        let cancel = CancellationToken::new();
        let mut cancel_key_epoch = None;
        if let Some(key) = cancel_key {
            let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
            if let Some((_, previous)) = self.cancel_keys.remove(key) {
                previous.token.cancel();
            }
            self.cancel_keys.insert(key.to_string(), CancelEntry { token: cancel.clone(), epoch });
            cancel_key_epoch = Some(epoch);
        }

        Ok(RequestGuard { _permit: permit, cancel, cancel_key_epoch })
    }

    /// Drop the registry entry for `cancel_key` if no newer request has
    /// superseded it — called at the end of a request so a completed
    /// request doesn't leave a dead token in the map for a key nobody will
    /// reuse. A higher epoch means a newer request already replaced it, so
    /// there is nothing to clean up.
    pub fn finish(&self, cancel_key: Option<&str>, guard: &RequestGuard) {
        if let (Some(key), Some(epoch)) = (cancel_key, guard.cancel_key_epoch) {
            self.cancel_keys.remove_if(key, |_, entry| entry.epoch == epoch);
        }
    }

    #[cfg(test)]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_request_on_same_cancel_key_cancels_previous() {
        let lifecycle = Lifecycle::new(4);
        let first = lifecycle.begin(Some("client-1")).await.unwrap();
        assert!(!first.cancel.is_cancelled());

        let second = lifecycle.begin(Some("client-1")).await.unwrap();
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn distinct_cancel_keys_do_not_interfere() {
        let lifecycle = Lifecycle::new(4);
        let a = lifecycle.begin(Some("a")).await.unwrap();
        let b = lifecycle.begin(Some("b")).await.unwrap();
        assert!(!a.cancel.is_cancelled());
        assert!(!b.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn exhausted_concurrency_limit_surfaces_busy() {
        let lifecycle = Lifecycle::new(1);
        let _held = lifecycle.begin(None).await.unwrap();
        assert_eq!(lifecycle.available_permits(), 0);
        // Can't wait out the real 5s timeout in a unit test; a zero-capacity
        // semaphore demonstrates the same acquire-blocks behavior directly.
        let sem = Arc::new(Semaphore::new(0));
        let res = tokio::time::timeout(Duration::from_millis(20), sem.acquire_owned()).await;
        assert!(res.is_err());
    }
}
