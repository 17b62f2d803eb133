//! C3 — Cache Layer.
//!
//! Two TTL-bounded, freshness-keyed caches: `ListingCache` for `list()`
//! results and `MetaCache` for any JSON-serializable artifact produced by
//! the hierarchy walker or extraction engine. Both provide single-flight:
//! concurrent misses for the same key coalesce into one producer via a
//! per-key `tokio::sync::Mutex`, so waiters see either one computed result
//! or one propagated error — never a torn mix of the two.

use crate::error::Result;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

struct Entry<V> {
    value: V,
    token: String,
    inserted_at: Instant,
}

/// Generic TTL + freshness-token cache with single-flight coalescing.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, Entry<V>>,
    locks: DashMap<K, Arc<AsyncMutex<()>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: DashMap::new(), locks: DashMap::new() }
    }

    /// Look up `key`, treating an entry whose token no longer matches
    /// `token` or whose age exceeds the TTL as a miss (and evicting it).
    fn get_valid(&self, key: &K, token: &str) -> Option<V> {
        let hit = self.entries.get(key).and_then(|e| {
            if e.token == token && e.inserted_at.elapsed() <= self.ttl {
                Some(e.value.clone())
            } else {
                None
            }
        });
        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }

    /// Return the cached value for `(key, token)`, or run `compute` exactly
    /// once among any concurrently-racing callers and cache a clean
    /// success. A failed `compute` is propagated to every waiter currently
    /// blocked on it but never cached — the next miss retries.
    pub async fn get_or_compute<F, Fut>(&self, key: K, token: &str, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(v) = self.get_valid(&key, token) {
            return Ok(v);
        }

        let lock = self.locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone();
        let _guard = lock.lock().await;

        // Double-check: another waiter may have produced the value while we
        // were waiting for the per-key lock.
        if let Some(v) = self.get_valid(&key, token) {
            drop(_guard);
            self.locks.remove_if(&key, |_, l| Arc::strong_count(l) <= 1);
            return Ok(v);
        }

        let result = compute().await;
        if let Ok(ref v) = result {
            self.entries.insert(
                key.clone(),
                Entry { value: v.clone(), token: token.to_string(), inserted_at: Instant::now() },
            );
        }
        drop(_guard);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) <= 1);
        result
    }

    /// Drop a single key regardless of TTL — used when an admin refresh or
    /// a known freshness change makes a cached value definitely stale.
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every cached entry, used by the administrative refresh endpoint.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Key for the listing cache: a storage prefix within one logical source
/// (bucket/namespace or "default" for single-source setups).
pub type ListingKey = (String, String);

/// Key for the metadata cache: `(storage key, request fingerprint)`. The
/// freshness token is validated separately by `TtlCache` rather than
/// folded into the key, so a token change evicts without leaving orphaned
/// entries for every prior token.
pub type MetaKey = (String, String);

pub type ListingCache = TtlCache<ListingKey, crate::model::Listing>;
pub type MetaCache = TtlCache<MetaKey, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_misses() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = &cache;
            let calls = calls.clone();
            handles.push(async move {
                cache
                    .get_or_compute("k".to_string(), "t1", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42u32)
                    })
                    .await
            });
        }
        let results = futures::future::join_all(handles).await;
        for r in results {
            assert_eq!(r.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_change_is_a_miss() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(30));
        let v1 = cache.get_or_compute("k".to_string(), "t1", || async { Ok(1u32) }).await.unwrap();
        let v2 = cache.get_or_compute("k".to_string(), "t2", || async { Ok(2u32) }).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn failed_compute_is_not_cached() {
        use crate::error::EngineError;
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(30));
        let first = cache
            .get_or_compute("k".to_string(), "t1", || async {
                Err(EngineError::Unavailable("boom".into()))
            })
            .await;
        assert!(first.is_err());
        let second =
            cache.get_or_compute("k".to_string(), "t1", || async { Ok(7u32) }).await.unwrap();
        assert_eq!(second, 7);
    }
}
