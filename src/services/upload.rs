//! Upload orchestration: validation, spooling, scanning, capacity checks and
//! the commit of a logical file record against the blob store.
//!
//! Ordering matters: everything that can reject the upload cheaply runs
//! before the blob commit, and every step after the commit carries a
//! compensating release so a failed upload never leaks a reference.

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::path::Path;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    DuplicateCleanup, FileListResponse, FileQuery, FileRecordWithSize, FileResponse, StorageStats,
};
use crate::scanner::{self, ScanResult};
use crate::services::blob::BlobStore;
use crate::services::hasher::{self, SpooledUpload};
use crate::storage::StorageProvider;
use crate::validate::{self, ValidatedName};

pub struct FileService;

impl FileService {
    /// Accept an upload stream and commit it as a logical file record.
    ///
    /// The source is spooled exactly once; content is never re-read from the
    /// client. All rejection paths remove the spooled temp file.
    pub async fn upload<S>(
        db: &Database,
        provider: &dyn StorageProvider,
        config: &Config,
        source: S,
        declared_name: &str,
        declared_mime: Option<&str>,
    ) -> Result<FileResponse>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        // Name and extension checks happen before any byte is accepted.
        let validated = validate::validate_name(declared_name, &config.upload)?;

        let spooled = hasher::spool_to_temp(
            source,
            Path::new(&config.upload.temp_dir),
            config.upload.max_size,
        )
        .await?;

        match Self::commit(db, provider, config, &validated, declared_mime, &spooled).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // Harmless when the blob store already consumed the temp file
                hasher::cleanup_temp(&spooled.temp_path).await;
                Err(e)
            }
        }
    }

    async fn commit(
        db: &Database,
        provider: &dyn StorageProvider,
        config: &Config,
        validated: &ValidatedName,
        declared_mime: Option<&str>,
        spooled: &SpooledUpload,
    ) -> Result<FileResponse> {
        let head = Self::read_head(&spooled.temp_path).await?;
        let mime_type = validate::detect_mime_type(&head, &validated.sanitized_name, declared_mime);
        validate::validate_mime_type(&mime_type, &config.upload)?;

        let scan = Self::run_scan(config, validated, &mime_type, spooled).await?;

        // Advisory pre-check: rejects clear overruns before any bytes land.
        // Only new content adds physical bytes; duplicates are free.
        if BlobStore::get(db, &spooled.digest).await?.is_none() {
            let stats = BlobStore::stats(db).await?;
            if stats.physical_total as u64 + spooled.size > config.upload.total_limit {
                return Err(AppError::CapacityExceeded(
                    "Total storage limit exceeded. Cannot upload this file.".to_string(),
                ));
            }
        }

        let (blob, created) =
            BlobStore::resolve_or_create(db, provider, &spooled.digest, spooled.size, &spooled.temp_path)
                .await?;
        tracing::info!(
            "Upload {} resolved to blob {} (created: {}, refs: {})",
            validated.sanitized_name,
            blob.digest,
            created,
            blob.ref_count
        );

        let id = Uuid::new_v4().to_string();
        if let Err(e) = Self::insert_record(db, &id, validated, &mime_type, &spooled.digest, &scan).await
        {
            BlobStore::release(db, provider, &spooled.digest).await?;
            return Err(e);
        }

        // Authoritative post-check: concurrent uploads may each have passed
        // the pre-check; whoever lands over the limit rolls back fully.
        let stats = BlobStore::stats(db).await?;
        if stats.physical_total as u64 > config.upload.total_limit {
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(&id)
                .execute(db.pool())
                .await?;
            BlobStore::release(db, provider, &spooled.digest).await?;
            return Err(AppError::CapacityExceeded(
                "Total storage limit exceeded. Cannot upload this file.".to_string(),
            ));
        }

        let record = Self::fetch_with_size(db, &id).await?.ok_or_else(|| {
            AppError::Inconsistent(format!("File {} vanished after commit", id))
        })?;
        Ok(record.into())
    }

    /// First bytes of the spooled file, for content-based MIME sniffing.
    async fn read_head(path: &Path) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut head = vec![0u8; 2048];
        let mut filled = 0;
        loop {
            let n = file.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == head.len() {
                break;
            }
        }
        head.truncate(filled);
        Ok(head)
    }

    /// Run the sensitive-content scan off the async executor. The scan is
    /// advisory and cannot fail the upload; only executor-level failures
    /// surface as errors.
    async fn run_scan(
        config: &Config,
        validated: &ValidatedName,
        mime_type: &str,
        spooled: &SpooledUpload,
    ) -> Result<ScanResult> {
        let path = spooled.temp_path.clone();
        let extension = validated.extension.clone();
        let mime = mime_type.to_string();
        let scan_config = config.scan.clone();

        tokio::task::spawn_blocking(move || scanner::scan_file(&path, &extension, &mime, &scan_config))
            .await
            .map_err(|e| AppError::Internal(format!("Scan task failed: {}", e)))
    }

    async fn insert_record(
        db: &Database,
        id: &str,
        validated: &ValidatedName,
        mime_type: &str,
        digest: &str,
        scan: &ScanResult,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, digest, original_name, mime_type, extension,
                sensitive_detected, sensitive_markers, sensitive_summary, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(digest)
        .bind(&validated.sanitized_name)
        .bind(mime_type)
        .bind(&validated.extension)
        .bind(scan.detected)
        .bind(scan.markers_json())
        .bind(&scan.summary)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;
        Ok(())
    }

    const WITH_SIZE: &'static str = r#"
        SELECT f.id, f.digest, f.original_name, f.mime_type, f.extension,
               f.sensitive_detected, f.sensitive_markers, f.sensitive_summary,
               f.created_at, b.size
        FROM files f JOIN blobs b ON b.digest = f.digest
    "#;

    async fn fetch_with_size(db: &Database, id: &str) -> Result<Option<FileRecordWithSize>> {
        let record = sqlx::query_as(&format!("{} WHERE f.id = ?", Self::WITH_SIZE))
            .bind(id)
            .fetch_optional(db.pool())
            .await?;
        Ok(record)
    }

    /// Newest-first page of file records, optionally filtered by a filename
    /// substring.
    pub async fn list(db: &Database, query: &FileQuery) -> Result<FileListResponse> {
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(20).clamp(1, 100);
        let offset = (page as i64 - 1) * page_size as i64;
        let like = query
            .q
            .as_ref()
            .map(|q| format!("%{}%", q.trim()))
            .filter(|l| l != "%%");

        let (count, rows): (i64, Vec<FileRecordWithSize>) = if let Some(ref like) = like {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM files WHERE original_name LIKE ?")
                    .bind(like)
                    .fetch_one(db.pool())
                    .await?;
            let rows = sqlx::query_as(&format!(
                "{} WHERE f.original_name LIKE ? ORDER BY f.created_at DESC, f.id DESC LIMIT ? OFFSET ?",
                Self::WITH_SIZE
            ))
            .bind(like)
            .bind(page_size as i64)
            .bind(offset)
            .fetch_all(db.pool())
            .await?;
            (count, rows)
        } else {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
                .fetch_one(db.pool())
                .await?;
            let rows = sqlx::query_as(&format!(
                "{} ORDER BY f.created_at DESC, f.id DESC LIMIT ? OFFSET ?",
                Self::WITH_SIZE
            ))
            .bind(page_size as i64)
            .bind(offset)
            .fetch_all(db.pool())
            .await?;
            (count, rows)
        };

        Ok(FileListResponse {
            count,
            results: rows.into_iter().map(FileResponse::from).collect(),
        })
    }

    pub async fn get(db: &Database, id: &str) -> Result<FileResponse> {
        let record = Self::fetch_with_size(db, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("File {} not found", id)))?;
        Ok(record.into())
    }

    /// Fetch the record and its blob bytes for download. A record whose blob
    /// row or backend object is missing is a store inconsistency, not a 404.
    pub async fn download(
        db: &Database,
        provider: &dyn StorageProvider,
        id: &str,
    ) -> Result<(FileResponse, Bytes)> {
        let record = Self::fetch_with_size(db, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("File {} not found", id)))?;

        let blob = BlobStore::get(db, &record.digest).await?.ok_or_else(|| {
            AppError::Inconsistent(format!("Blob {} missing for file {}", record.digest, id))
        })?;

        let bytes = provider.get(&blob.location).await.map_err(|e| match e {
            AppError::NotFound(_) => {
                AppError::Inconsistent(format!("Blob {} has no stored bytes", record.digest))
            }
            other => other,
        })?;

        Ok((record.into(), bytes))
    }

    /// Delete a record and drop its blob reference. Physical reclaim happens
    /// inside the release when this was the last reference.
    pub async fn delete(db: &Database, provider: &dyn StorageProvider, id: &str) -> Result<()> {
        let row: Option<(String,)> = sqlx::query_as("SELECT digest FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(db.pool())
            .await?;
        let (digest,) = row.ok_or_else(|| AppError::NotFound(format!("File {} not found", id)))?;

        let deleted = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await?
            .rows_affected();
        if deleted == 0 {
            // Lost a race with another delete of the same record
            return Err(AppError::NotFound(format!("File {} not found", id)));
        }

        BlobStore::release(db, provider, &digest).await?;
        tracing::info!("Deleted file {} (blob {})", id, digest);
        Ok(())
    }

    pub async fn storage_stats(db: &Database) -> Result<StorageStats> {
        BlobStore::stats(db).await
    }

    /// Remove redundant records pointing at the same content, keeping the
    /// oldest record per digest. Every removal goes through the regular
    /// delete-and-release path, so reference counts stay exact.
    pub async fn remove_duplicates(
        db: &Database,
        provider: &dyn StorageProvider,
    ) -> Result<DuplicateCleanup> {
        let duplicated: Vec<(String,)> =
            sqlx::query_as("SELECT digest FROM files GROUP BY digest HAVING COUNT(*) > 1")
                .fetch_all(db.pool())
                .await?;

        let mut removed_count = 0u64;
        for (digest,) in &duplicated {
            let ids: Vec<(String,)> = sqlx::query_as(
                "SELECT id FROM files WHERE digest = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(digest)
            .fetch_all(db.pool())
            .await?;

            for (id,) in ids.iter().skip(1) {
                let deleted = sqlx::query("DELETE FROM files WHERE id = ?")
                    .bind(id)
                    .execute(db.pool())
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    continue;
                }
                BlobStore::release(db, provider, digest).await?;
                removed_count += 1;
            }
        }

        let updated_stats = BlobStore::stats(db).await?;
        tracing::info!(
            "Duplicate cleanup removed {} record(s) across {} blob(s)",
            removed_count,
            duplicated.len()
        );
        Ok(DuplicateCleanup {
            removed_count,
            blobs_affected: duplicated.len() as u64,
            updated_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Marker;
    use crate::storage::LocalStorage;
    use futures::stream;

    struct TestEnv {
        db: Database,
        provider: LocalStorage,
        config: Config,
        _base: tempfile::TempDir,
        _temp: tempfile::TempDir,
    }

    async fn env() -> TestEnv {
        let base = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.upload.temp_dir = temp.path().to_string_lossy().into_owned();
        config.storage.local_path = base.path().to_string_lossy().into_owned();
        TestEnv {
            db: Database::in_memory().await.unwrap(),
            provider: LocalStorage::with_base_path(base.path()),
            config,
            _base: base,
            _temp: temp,
        }
    }

    fn source_of(content: &'static [u8]) -> impl Stream<Item = Result<Bytes>> + Unpin {
        stream::iter(vec![Ok(Bytes::from_static(content))])
    }

    async fn upload(env: &TestEnv, content: &'static [u8], name: &str) -> Result<FileResponse> {
        FileService::upload(
            &env.db,
            &env.provider,
            &env.config,
            source_of(content),
            name,
            None,
        )
        .await
    }

    fn temp_dir_is_empty(env: &TestEnv) -> bool {
        std::fs::read_dir(env._temp.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn identical_uploads_share_one_blob() {
        let env = env().await;

        let a = upload(&env, b"hello", "a.txt").await.unwrap();
        let b = upload(&env, b"hello", "b.txt").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.size, 5);
        assert_eq!(b.size, 5);

        let (blob_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        assert_eq!(blob_count, 1);

        let stats = FileService::storage_stats(&env.db).await.unwrap();
        assert_eq!(stats.reported_total, 10);
        assert_eq!(stats.physical_total, 5);
        assert_eq!(stats.savings, 5);
        assert_eq!(stats.dedup_ratio, 0.5);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn blocked_extension_leaves_no_trace() {
        let env = env().await;
        let err = upload(&env, b"MZ...", "setup.exe").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let (files,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        let (blobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        assert_eq!(files, 0);
        assert_eq!(blobs, 0);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn oversize_upload_is_rejected_mid_stream() {
        let mut env = env().await;
        env.config.upload.max_size = 4;
        let err = upload(&env, b"way too big", "big.txt").await.unwrap_err();
        assert!(matches!(err, AppError::TooLarge(_)));
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn capacity_limit_rejects_new_content_but_admits_duplicates() {
        let mut env = env().await;
        env.config.upload.total_limit = 10;

        upload(&env, b"12345678", "first.txt").await.unwrap();

        // New content would push physical usage past the limit
        let err = upload(&env, b"xxxxxxxx", "second.txt").await.unwrap_err();
        assert!(matches!(err, AppError::CapacityExceeded(_)));

        // Duplicate content adds no physical bytes, so it still fits
        upload(&env, b"12345678", "third.txt").await.unwrap();

        let stats = FileService::storage_stats(&env.db).await.unwrap();
        assert_eq!(stats.physical_total, 8);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn capacity_post_check_rolls_back_the_whole_commit() {
        let mut env = env().await;
        env.config.upload.total_limit = 10;

        upload(&env, b"12345678", "first.txt").await.unwrap();

        // A leftover unreferenced row (a crashed earlier upload) makes the
        // digest look known, so the advisory pre-check is skipped and the
        // authoritative post-check has to reject.
        let digest = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(b"overflow"))
        };
        sqlx::query(
            "INSERT INTO blobs (digest, size, location, ref_count, status, created_at, updated_at)
             VALUES (?, 8, ?, 0, 'pending', ?, ?)",
        )
        .bind(&digest)
        .bind(BlobStore::allocate_location(&digest))
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(env.db.pool())
        .await
        .unwrap();

        let err = upload(&env, b"overflow", "second.txt").await.unwrap_err();
        assert!(matches!(err, AppError::CapacityExceeded(_)));

        // Rollback removed the record and released the reference; the
        // now-unreferenced row was reclaimed with it
        let (records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE digest = ?")
            .bind(&digest)
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        assert_eq!(records, 0);
        assert!(BlobStore::get(&env.db, &digest).await.unwrap().is_none());
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn scan_outcome_is_persisted_with_the_record() {
        let env = env().await;
        let resp = upload(&env, b"Contact john@example.com for details", "contact.txt")
            .await
            .unwrap();
        assert!(resp.sensitive_detected);
        assert_eq!(resp.sensitive_markers, vec![Marker::Email]);
        assert_eq!(resp.sensitive_summary, "Contains email address");

        // Unsupported extension is never scanned
        let resp = upload(&env, b"john@example.com", "contact.csv").await.unwrap();
        assert!(!resp.sensitive_detected);
        assert!(resp.sensitive_markers.is_empty());
    }

    #[tokio::test]
    async fn delete_reclaims_only_after_last_reference() {
        let env = env().await;
        let a = upload(&env, b"shared content", "a.txt").await.unwrap();
        let b = upload(&env, b"shared content", "b.txt").await.unwrap();

        FileService::delete(&env.db, &env.provider, &a.id).await.unwrap();
        let (blobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        assert_eq!(blobs, 1);

        FileService::delete(&env.db, &env.provider, &b.id).await.unwrap();
        let (blobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        assert_eq!(blobs, 0);

        let err = FileService::delete(&env.db, &env.provider, &b.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn download_roundtrip_and_missing_bytes() {
        let env = env().await;
        let resp = upload(&env, b"round trip payload", "data.bin").await.unwrap();

        let (meta, bytes) = FileService::download(&env.db, &env.provider, &resp.id)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"round trip payload");
        assert_eq!(meta.original_name, "data.bin");

        // Bytes removed behind the store's back: inconsistency, not 404
        let blob = BlobStore::get(&env.db, &meta_digest(&env, &resp.id).await)
            .await
            .unwrap()
            .unwrap();
        env.provider.delete(&blob.location).await.unwrap();
        let err = FileService::download(&env.db, &env.provider, &resp.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Inconsistent(_)));
    }

    async fn meta_digest(env: &TestEnv, id: &str) -> String {
        let (digest,): (String,) = sqlx::query_as("SELECT digest FROM files WHERE id = ?")
            .bind(id)
            .fetch_one(env.db.pool())
            .await
            .unwrap();
        digest
    }

    #[tokio::test]
    async fn list_paginates_newest_first_and_filters() {
        let env = env().await;
        upload(&env, b"one", "report_january.txt").await.unwrap();
        upload(&env, b"two", "report_february.txt").await.unwrap();
        upload(&env, b"three", "photo.txt").await.unwrap();

        let all = FileService::list(
            &env.db,
            &FileQuery {
                page: None,
                page_size: None,
                q: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(all.count, 3);
        assert_eq!(all.results.len(), 3);

        let filtered = FileService::list(
            &env.db,
            &FileQuery {
                page: Some(1),
                page_size: Some(1),
                q: Some("report".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(filtered.count, 2);
        assert_eq!(filtered.results.len(), 1);
        assert!(filtered.results[0].original_name.starts_with("report"));
    }

    #[tokio::test]
    async fn list_tolerates_extreme_page_numbers() {
        let env = env().await;
        upload(&env, b"one", "a.txt").await.unwrap();

        let out = FileService::list(
            &env.db,
            &FileQuery {
                page: Some(u32::MAX),
                page_size: Some(100),
                q: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.count, 1);
        assert!(out.results.is_empty());
    }

    #[tokio::test]
    async fn duplicate_cleanup_keeps_oldest_record() {
        let env = env().await;
        let first = upload(&env, b"same bytes", "keep.txt").await.unwrap();
        upload(&env, b"same bytes", "drop1.txt").await.unwrap();
        upload(&env, b"same bytes", "drop2.txt").await.unwrap();
        upload(&env, b"unique", "other.txt").await.unwrap();

        // Force distinct created_at ordering for the kept record
        sqlx::query("UPDATE files SET created_at = ? WHERE id = ?")
            .bind("2000-01-01T00:00:00+00:00")
            .bind(&first.id)
            .execute(env.db.pool())
            .await
            .unwrap();

        let cleanup = FileService::remove_duplicates(&env.db, &env.provider)
            .await
            .unwrap();
        assert_eq!(cleanup.removed_count, 2);
        assert_eq!(cleanup.blobs_affected, 1);

        let survivors = FileService::list(
            &env.db,
            &FileQuery {
                page: None,
                page_size: None,
                q: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(survivors.count, 2);
        assert!(survivors
            .results
            .iter()
            .any(|r| r.original_name == "keep.txt"));

        // The shared blob keeps exactly one reference
        let (refs,): (i64,) =
            sqlx::query_as("SELECT ref_count FROM blobs WHERE digest = ?")
                .bind(meta_digest(&env, &first.id).await)
                .fetch_one(env.db.pool())
                .await
                .unwrap();
        assert_eq!(refs, 1);
    }
}
