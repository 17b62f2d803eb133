//! C1 — Storage Adapter.
//!
//! Turns an opaque storage key into a seekable byte stream, lists objects
//! at a prefix, and reports a cheap freshness probe. Two concrete adapters
//! live in `local` (filesystem) and `remote` (ranged-HTTP object store);
//! the rest of the engine depends only on the `StorageAdapter` trait below.

mod local;
mod remote;

pub use local::LocalFsAdapter;
pub use remote::{ObjectStoreAdapter, ObjectStoreConfig};

use crate::error::{EngineError, Result};
use crate::model::Listing;
use async_trait::async_trait;
use bytes::Bytes;

/// A storage key's freshness, opaque to everything except the adapter that
/// produced it. Stable while the underlying bytes are stable.
pub type FreshnessToken = String;

/// Random-access read capability over one storage object's bytes.
///
/// A full read of any byte range is atomic with respect to the token
/// returned by the adapter's `open()`: if the underlying bytes would
/// differ from what that token describes, the read must fail with
/// `EngineError::Stale` rather than silently returning mixed bytes.
#[async_trait]
pub trait SeekableStream: Send + Sync {
    /// Total length in bytes of the object as of `open()`.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `length` bytes starting at `offset`. `offset + length` must not
    /// exceed `len()`.
    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes>;

    /// The freshness token valid for the bytes this stream serves.
    fn token(&self) -> &str;
}

/// Factory for seekable streams and listings over one storage backend.
///
/// Adapters are stateless aside from configured credentials/base path — all
/// mutable bookkeeping (caches, pooled handles) lives above this trait.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Non-recursive listing at `prefix`. `delimiter = "/"` groups children
    /// into virtual folders via common-prefix grouping; `delimiter = ""`
    /// returns a flat recursive listing.
    async fn list(&self, prefix: &str, delimiter: &str) -> Result<Listing>;

    /// Open a seekable stream over `key`'s current bytes.
    async fn open(&self, key: &str) -> Result<Box<dyn SeekableStream>>;

    /// Cheap head-style freshness probe, without opening a stream.
    async fn freshness(&self, key: &str) -> Result<FreshnessToken>;
}

/// Reject keys containing traversal sequences or absolute prefixes before
/// any adapter touches storage. Every `StorageAdapter` impl calls this
/// first.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(EngineError::Forbidden("empty key".to_string()));
    }
    if key.starts_with('/') {
        return Err(EngineError::Forbidden("absolute key not allowed".to_string()));
    }
    if key.split('/').any(|seg| seg == "..") {
        return Err(EngineError::Forbidden("path traversal in key".to_string()));
    }
    Ok(())
}
