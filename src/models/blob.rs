use serde::Serialize;
use sqlx::FromRow;

/// Lifecycle marker for a blob row. `pending` rows may not yet have backing
/// bytes; the reconciliation sweep reclaims stale ones.
pub const BLOB_STATUS_PENDING: &str = "pending";
pub const BLOB_STATUS_READY: &str = "ready";

/// Content-addressed storage unit. One row per unique byte content; the blob
/// store is the only writer of `ref_count`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Blob {
    /// Lowercase hex SHA-256 of the content. Immutable identity.
    pub digest: String,
    pub size: i64,
    /// Opaque backend path. Set at creation; a remote backend may rewrite it
    /// once with its normalized object key.
    pub location: String,
    pub ref_count: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Blob {
    pub fn is_ready(&self) -> bool {
        self.status == BLOB_STATUS_READY
    }
}

/// Storage statistics exposed by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    /// Sum of blob sizes over all records (what users think they stored).
    pub reported_total: i64,
    /// Sum of unique blob sizes (actual bytes on the backend).
    pub physical_total: i64,
    pub savings: i64,
    /// `1 - physical/reported`, 0 for an empty store. Always in [0, 1).
    pub dedup_ratio: f64,
}
