//! Filesystem storage adapter: resolves keys against a configured base
//! directory and serves ranged reads with `std::fs`.

use super::{validate_key, FreshnessToken, SeekableStream, StorageAdapter};
use crate::error::{EngineError, Result};
use crate::model::{Listing, StorageObject};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

/// Serves storage keys rooted at `base_dir`, rejecting any resolved path
/// that escapes it — the same canonicalize-then-prefix-check pattern as a
/// typical path-traversal guard in an HTTP API
/// (canonicalize both sides, then `starts_with`).
pub struct LocalFsAdapter {
    base_dir: PathBuf,
}

impl LocalFsAdapter {
    /// `base_dir` must exist and be readable; canonicalized eagerly so
    /// every later comparison is canonical-to-canonical.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let canonical = base_dir.canonicalize().map_err(|e| {
            EngineError::Unavailable(format!("base_dir {}: {e}", base_dir.display()))
        })?;
        if !canonical.is_dir() {
            return Err(EngineError::Unavailable(format!(
                "base_dir {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self { base_dir: canonical })
    }

    /// Resolve `key` against `base_dir`, rejecting traversal and symlink
    /// escape. Does not require the path to already exist.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let full = self.base_dir.join(key);
        // Canonicalize the deepest existing ancestor, then re-append the
        // remainder, so non-existent leaf components (still valid for
        // `list()` on a not-yet-created prefix) don't fail canonicalization.
        let (existing, rest) = split_existing_prefix(&full);
        let canonical_existing = existing.canonicalize().map_err(|e| {
            EngineError::NotFound(format!("{key}: {e}"))
        })?;
        if !canonical_existing.starts_with(&self.base_dir) {
            return Err(EngineError::Forbidden(format!("{key} escapes base_dir")));
        }
        let resolved = canonical_existing.join(&rest);
        Ok(resolved)
    }

    fn token_for(meta: &fs::Metadata) -> FreshnessToken {
        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}-{}", meta.len(), mtime_nanos)
    }
}

fn split_existing_prefix(path: &Path) -> (PathBuf, PathBuf) {
    let mut existing = path.to_path_buf();
    let mut rest = PathBuf::new();
    while !existing.exists() {
        if let Some(name) = existing.file_name() {
            let mut r = PathBuf::from(name);
            r.push(&rest);
            rest = r;
        }
        if !existing.pop() {
            break;
        }
    }
    (existing, rest)
}

#[async_trait]
impl StorageAdapter for LocalFsAdapter {
    async fn list(&self, prefix: &str, delimiter: &str) -> Result<Listing> {
        let dir = self.resolve(prefix)?;
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!("{prefix} is not a directory")));
        }

        let mut listing = Listing::default();
        if delimiter.is_empty() {
            walk_recursive(&dir, &dir, &mut listing)?;
        } else {
            for entry in fs::read_dir(&dir)
                .map_err(|e| EngineError::Unavailable(e.to_string()))?
            {
                let entry = entry.map_err(|e| EngineError::Unavailable(e.to_string()))?;
                let name = entry.file_name().to_string_lossy().to_string();
                let meta = entry.metadata().map_err(|e| EngineError::Unavailable(e.to_string()))?;
                let rel = join_key(prefix, &name);
                if meta.is_dir() {
                    listing.folders.push(rel);
                } else {
                    listing.files.push(to_storage_object(&rel, &meta));
                }
            }
            listing.folders.sort();
            listing.files.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Ok(listing)
    }

    async fn open(&self, key: &str) -> Result<Box<dyn SeekableStream>> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).map_err(|_| EngineError::NotFound(key.to_string()))?;
        if !meta.is_file() {
            return Err(EngineError::NotFound(format!("{key} is not a file")));
        }
        let token = Self::token_for(&meta);
        let file = fs::File::open(&path).map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Box::new(LocalStream { file: Mutex::new(file), len: meta.len(), token, path }))
    }

    async fn freshness(&self, key: &str) -> Result<FreshnessToken> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).map_err(|_| EngineError::NotFound(key.to_string()))?;
        Ok(Self::token_for(&meta))
    }
}

fn walk_recursive(base: &Path, dir: &Path, out: &mut Listing) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| EngineError::Unavailable(e.to_string()))? {
        let entry = entry.map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if meta.is_dir() {
            walk_recursive(base, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.files.push(to_storage_object(&rel, &meta));
        }
    }
    out.files.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(())
}

fn to_storage_object(key: &str, meta: &fs::Metadata) -> StorageObject {
    let last_modified_unix_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    StorageObject {
        key: key.to_string(),
        size: meta.len(),
        last_modified_unix_ms,
        etag: LocalFsAdapter::token_for(meta),
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() || prefix == "/" {
        name.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), name)
    }
}

/// A `SeekableStream` over one open local file, re-validated for staleness
/// on every read (the file may have been overwritten between `open()` and
/// a later `read_range`).
struct LocalStream {
    file: Mutex<fs::File>,
    len: u64,
    token: FreshnessToken,
    path: PathBuf,
}

#[async_trait]
impl SeekableStream for LocalStream {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        if let Ok(meta) = fs::metadata(&self.path) {
            if LocalFsAdapter::token_for(&meta) != self.token {
                return Err(EngineError::Stale);
            }
        }
        let mut buf = vec![0u8; length as usize];
        let mut file = self.file.lock().expect("local file mutex poisoned");
        file.seek(SeekFrom::Start(offset)).map_err(|e| EngineError::Unavailable(e.to_string()))?;
        file.read_exact(&mut buf).map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn token(&self) -> &str {
        &self.token
    }
}
