use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::scanner::Marker;

/// User-visible logical file joined with its blob's size, the shape list and
/// detail queries return. Owns a reference to a blob, never bytes.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecordWithSize {
    pub id: String,
    pub digest: String,
    pub original_name: String,
    pub mime_type: String,
    pub extension: String,
    pub sensitive_detected: bool,
    /// JSON array of marker kinds, sorted. Written once at creation.
    pub sensitive_markers: String,
    pub sensitive_summary: String,
    pub created_at: String,
    pub size: i64,
}

/// Serialized record shape returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct FileResponse {
    pub id: String,
    pub original_name: String,
    pub mime_type: String,
    pub extension: String,
    pub size: i64,
    pub sensitive_detected: bool,
    pub sensitive_markers: Vec<Marker>,
    pub sensitive_summary: String,
    pub created_at: String,
}

impl From<FileRecordWithSize> for FileResponse {
    fn from(r: FileRecordWithSize) -> Self {
        let markers = serde_json::from_str(&r.sensitive_markers).unwrap_or_default();
        Self {
            id: r.id,
            original_name: r.original_name,
            mime_type: r.mime_type,
            extension: r.extension,
            size: r.size,
            sensitive_detected: r.sensitive_detected,
            sensitive_markers: markers,
            sensitive_summary: r.sensitive_summary,
            created_at: r.created_at,
        }
    }
}

/// Paginated list response
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub count: i64,
    pub results: Vec<FileResponse>,
}

/// File list query parameters
#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Filename substring filter
    pub q: Option<String>,
}

/// Result of the duplicate-record cleanup operation.
#[derive(Debug, Serialize)]
pub struct DuplicateCleanup {
    pub removed_count: u64,
    pub blobs_affected: u64,
    pub updated_stats: crate::models::StorageStats,
}
