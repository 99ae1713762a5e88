use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;

/// Narrow durable-storage surface the blob store consumes. `location` is
/// opaque to callers; only the backend interprets it.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Persist the file at `local_path` under `location`. May consume the
    /// source file (move semantics); callers must not rely on it afterwards.
    /// Returns a normalized location when the backend rewrites identifiers,
    /// `None` to keep the caller-allocated one.
    async fn put_file(&self, location: &str, local_path: &Path) -> Result<Option<String>>;

    /// Read the bytes stored at `location`. `NotFound` if absent.
    async fn get(&self, location: &str) -> Result<Bytes>;

    /// Delete the object at `location`. Idempotent: deleting an absent
    /// object succeeds.
    async fn delete(&self, location: &str) -> Result<()>;

    /// Check whether an object exists at `location`.
    async fn exists(&self, location: &str) -> Result<bool>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}
