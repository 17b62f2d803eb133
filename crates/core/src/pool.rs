//! C2 — Reader Pool.
//!
//! Owns a bounded set of open container handles keyed by `(key, freshness
//! token)`, shared read-only across concurrent requests. The `hdf5` C
//! library only supports opening a real file (or a fully-buffered
//! in-memory file), not a custom streaming VFD, so a handle backed by a
//! remote object is materialized once into a spooled temp file via ranged
//! reads and then opened normally — see DESIGN.md for the full rationale.

use crate::error::{EngineError, Result};
use crate::storage::{SeekableStream, StorageAdapter};
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// Materialization reads this many bytes per chunk while spooling a remote
/// object to a local temp file, checked against the cancellation token
/// between chunks for sub-second cancellation granularity.
const MATERIALIZE_CHUNK: u64 = 4 * 1024 * 1024;

/// A read-only view over one container's bytes, identified by `(key,
/// token)`. Shared immutably across concurrent requests; the HDF5 library
/// is not safe for unsynchronized concurrent access from multiple threads
/// on one handle, so every access goes through `file`'s mutex.
pub struct ContainerHandle {
    pub key: String,
    pub token: String,
    file: PlMutex<hdf5::File>,
    _spool: Option<tempfile::NamedTempFile>,
}

impl ContainerHandle {
    /// Run `f` with exclusive access to the underlying `hdf5::File`. This
    /// is the only way to reach the handle's HDF5 object — callers never
    /// see the lock guard directly, so they cannot hold it across an
    /// `.await` point.
    pub fn with_file<T>(&self, f: impl FnOnce(&hdf5::File) -> Result<T>) -> Result<T> {
        let guard = self.file.lock();
        f(&guard)
    }
}

struct PoolEntry {
    handle: Arc<ContainerHandle>,
    last_released: AtomicU64,
}

/// Bounded, LRU-evicting map from `(key, token)` to shared container
/// handles. A handle with a stale token is superseded on the next
/// `acquire` for the same key; existing borrowers keep using their `Arc`
/// until they drop it.
pub struct ReaderPool {
    storage: Arc<dyn StorageAdapter>,
    max_open: usize,
    entries: Mutex<HashMap<(String, String), PoolEntry>>,
    clock: AtomicU64,
    // Per-key single-flight guard around storage.open + materialize, so
    // concurrent first-time acquires for the same key pay for one open
    // rather than racing to materialize independently.
    open_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl ReaderPool {
    pub fn new(storage: Arc<dyn StorageAdapter>, max_open: usize) -> Self {
        Self {
            storage,
            max_open,
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            open_locks: DashMap::new(),
        }
    }

    /// The underlying storage adapter, for callers that need `list()` or
    /// `freshness()` directly rather than an opened container handle.
    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    /// Acquire a handle for `key`, reusing a cached one if its token still
    /// matches the storage's current freshness. `cancel` is observed while
    /// materializing a fresh handle (the expensive path).
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ContainerHandle>> {
        let token = self.storage.freshness(key).await?;

        if let Some(handle) = self.lookup(key, &token) {
            return Ok(handle);
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let lock = self
            .open_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Double-check: another waiter may have materialized this exact
        // token while we were blocked on the per-key lock.
        if let Some(handle) = self.lookup(key, &token) {
            drop(_guard);
            self.open_locks.remove_if(key, |_, l| Arc::strong_count(l) <= 1);
            return Ok(handle);
        }

        let result = self.open_and_materialize(key, &token, cancel).await;
        drop(_guard);
        self.open_locks.remove_if(key, |_, l| Arc::strong_count(l) <= 1);
        result
    }

    async fn open_and_materialize(
        &self,
        key: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ContainerHandle>> {
        let stream = self.storage.open(key).await?;
        if stream.token() != token {
            // Freshness moved again between the probe and the open; surface
            // as Stale rather than serving mismatched metadata.
            return Err(EngineError::Stale);
        }
        let handle = Arc::new(materialize(key, stream.as_ref(), cancel).await?);
        self.insert(key, token, handle.clone());
        Ok(handle)
    }

    fn lookup(&self, key: &str, token: &str) -> Option<Arc<ContainerHandle>> {
        let entries = self.entries.lock().expect("reader pool mutex poisoned");
        entries.get(&(key.to_string(), token.to_string())).map(|e| e.handle.clone())
    }

    fn insert(&self, key: &str, token: &str, handle: Arc<ContainerHandle>) {
        let mut entries = self.entries.lock().expect("reader pool mutex poisoned");
        let now = self.clock.fetch_add(1, Ordering::Relaxed);

        // Drop superseded entries for this key — new acquires should never
        // hand out an old token once a fresher one is known, though
        // existing borrowers of the old Arc keep it alive regardless.
        entries.retain(|(k, _), _| k != key);
        entries.insert(
            (key.to_string(), token.to_string()),
            PoolEntry { handle, last_released: AtomicU64::new(now) },
        );

        while entries.len() > self.max_open {
            let evict_key = entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.handle) == 1)
                .min_by_key(|(_, e)| e.last_released.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            match evict_key {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break, // every remaining handle is borrowed; over capacity until released
            }
        }
    }
}

/// Copy a seekable stream's bytes into a spooled temp file under bounded
/// chunk size, then open it as an HDF5 container. For a local-disk stream
/// this is a full copy of the file; callers that want to skip the copy for
/// local storage can special-case it above this layer (kept uniform here
/// for correctness over micro-optimization).
async fn materialize(
    key: &str,
    stream: &dyn SeekableStream,
    cancel: &CancellationToken,
) -> Result<ContainerHandle> {
    let mut spool = tempfile::NamedTempFile::new()
        .map_err(|e| EngineError::Unavailable(format!("tempfile: {e}")))?;

    let mut offset = 0u64;
    let len = stream.len();
    while offset < len {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let chunk_len = MATERIALIZE_CHUNK.min(len - offset);
        let bytes = stream.read_range(offset, chunk_len).await?;
        spool
            .write_all(&bytes)
            .map_err(|e| EngineError::Unavailable(format!("spool write: {e}")))?;
        offset += chunk_len;
    }
    spool.flush().map_err(|e| EngineError::Unavailable(format!("spool flush: {e}")))?;

    let path = spool.path().to_path_buf();
    let file = hdf5::File::open(&path).map_err(|e| {
        EngineError::CorruptContainer(format!("{key}: {e}"))
    })?;

    Ok(ContainerHandle {
        key: key.to_string(),
        token: stream.token().to_string(),
        file: PlMutex::new(file),
        _spool: Some(spool),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Listing;
    use crate::storage::{FreshnessToken, LocalFsAdapter};
    use std::sync::atomic::AtomicUsize;

    /// Wraps `LocalFsAdapter` and counts `open()` calls, so tests can assert
    /// on how many times the pool actually materialized a container.
    struct CountingAdapter {
        inner: LocalFsAdapter,
        opens: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StorageAdapter for CountingAdapter {
        async fn list(&self, prefix: &str, delimiter: &str) -> Result<Listing> {
            self.inner.list(prefix, delimiter).await
        }

        async fn open(&self, key: &str) -> Result<Box<dyn SeekableStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open(key).await
        }

        async fn freshness(&self, key: &str) -> Result<FreshnessToken> {
            self.inner.freshness(key).await
        }
    }

    fn write_minimal_h5(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = hdf5::File::create(&path).unwrap();
        file.new_dataset::<i32>().shape(4).create("d").unwrap();
        path
    }

    #[tokio::test]
    async fn acquire_reuses_cached_handle_for_same_token() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_h5(dir.path(), "sample.h5");
        let adapter = Arc::new(LocalFsAdapter::new(dir.path()).unwrap());
        let pool = ReaderPool::new(adapter, 4);
        let cancel = CancellationToken::new();

        let a = pool.acquire("sample.h5", &cancel).await.unwrap();
        let b = pool.acquire("sample.h5", &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn acquire_reopens_after_freshness_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_minimal_h5(dir.path(), "sample.h5");
        let adapter = Arc::new(LocalFsAdapter::new(dir.path()).unwrap());
        let pool = ReaderPool::new(adapter, 4);
        let cancel = CancellationToken::new();

        let a = pool.acquire("sample.h5", &cancel).await.unwrap();

        // Touch the file so mtime-nanos changes, forcing a new token.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let file = hdf5::File::append(&path).unwrap();
        file.new_dataset::<i32>().shape(2).create("e").unwrap();
        drop(file);

        let b = pool.acquire("sample.h5", &cancel).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_first_time_acquires_open_storage_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_h5(dir.path(), "sample.h5");
        let adapter =
            Arc::new(CountingAdapter { inner: LocalFsAdapter::new(dir.path()).unwrap(), opens: AtomicUsize::new(0) });
        let pool = Arc::new(ReaderPool::new(adapter.clone(), 4));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { pool.acquire("sample.h5", &cancel).await }));
        }
        let results = futures::future::join_all(handles).await;
        let handles: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
        for h in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], h));
        }
        assert_eq!(adapter.opens.load(Ordering::SeqCst), 1);
    }
}
