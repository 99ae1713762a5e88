//! Content-addressed blob store: the race-safe get-or-create/increment and
//! decrement/reclaim protocols, plus the reconciliation sweep and storage
//! statistics.
//!
//! The blob row is the only shared mutable state in the core. Every
//! `ref_count` change is a single SQL arithmetic update or happens inside a
//! row-scoped transaction; nothing here reads-then-writes the count at the
//! application layer.

use chrono::Utc;
use std::path::Path;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{Blob, StorageStats, BLOB_STATUS_PENDING, BLOB_STATUS_READY};
use crate::services::hasher;
use crate::storage::StorageProvider;

pub struct BlobStore;

impl BlobStore {
    /// Backend location allocated for a new blob: `blobs/{digest[..2]}/{digest}`.
    pub fn allocate_location(digest: &str) -> String {
        format!("blobs/{}/{}", &digest[..2], digest)
    }

    pub async fn get(db: &Database, digest: &str) -> Result<Option<Blob>> {
        let blob = sqlx::query_as("SELECT * FROM blobs WHERE digest = ?")
            .bind(digest)
            .fetch_optional(db.pool())
            .await?;
        Ok(blob)
    }

    /// Resolve content to its blob, creating it on first sight. Returns the
    /// blob with this caller's reference already counted, and whether this
    /// call created it.
    ///
    /// The insert winner becomes the sole writer of storage bytes for the
    /// digest; every other concurrent caller lands in the duplicate branch
    /// and discards its own temp bytes. If the row vanishes between the
    /// conflicting insert and the increment (a concurrent reclaim), the
    /// resolve starts over.
    pub async fn resolve_or_create(
        db: &Database,
        provider: &dyn StorageProvider,
        digest: &str,
        size: u64,
        temp_path: &Path,
    ) -> Result<(Blob, bool)> {
        loop {
            let now = Utc::now().to_rfc3339();
            let location = Self::allocate_location(digest);

            let inserted = sqlx::query(
                r#"
                INSERT INTO blobs (digest, size, location, ref_count, status, created_at, updated_at)
                VALUES (?, ?, ?, 0, ?, ?, ?)
                ON CONFLICT(digest) DO NOTHING
                "#,
            )
            .bind(digest)
            .bind(size as i64)
            .bind(&location)
            .bind(BLOB_STATUS_PENDING)
            .bind(&now)
            .bind(&now)
            .execute(db.pool())
            .await?
            .rows_affected()
                == 1;

            if inserted {
                return Self::materialize(db, provider, digest, &location, temp_path).await;
            }

            // Duplicate content: no second physical write, just an atomic
            // reference bump on the existing row.
            if let Some(blob) = Self::bump_existing(db, digest, &now).await? {
                hasher::cleanup_temp(temp_path).await;
                return Ok((blob, false));
            }

            // The row was reclaimed between lookup and increment; retry.
            tracing::debug!("Blob {} reclaimed mid-resolve, retrying", digest);
        }
    }

    /// Take one reference on an existing row. `None` means the row vanished
    /// between the conflicting insert and the increment; the resolve loop
    /// starts over.
    async fn bump_existing(db: &Database, digest: &str, now: &str) -> Result<Option<Blob>> {
        let bumped = sqlx::query(
            "UPDATE blobs SET ref_count = ref_count + 1, updated_at = ? WHERE digest = ?",
        )
        .bind(now)
        .bind(digest)
        .execute(db.pool())
        .await?
        .rows_affected()
            == 1;

        if !bumped {
            return Ok(None);
        }
        let blob = Self::get(db, digest).await?.ok_or_else(|| {
            AppError::Inconsistent(format!("Blob {} vanished after increment", digest))
        })?;
        Ok(Some(blob))
    }

    /// Winner path: persist bytes for a freshly inserted pending row, then
    /// flip it to ready while taking the first reference.
    async fn materialize(
        db: &Database,
        provider: &dyn StorageProvider,
        digest: &str,
        location: &str,
        temp_path: &Path,
    ) -> Result<(Blob, bool)> {
        let now = Utc::now().to_rfc3339();

        match provider.put_file(location, temp_path).await {
            Ok(normalized) => {
                if let Some(ref loc) = normalized {
                    sqlx::query("UPDATE blobs SET location = ?, updated_at = ? WHERE digest = ?")
                        .bind(loc)
                        .bind(&now)
                        .bind(digest)
                        .execute(db.pool())
                        .await?;
                }
                // put_file has move semantics; this only mops up a leftover copy
                hasher::cleanup_temp(temp_path).await;

                sqlx::query(
                    "UPDATE blobs SET ref_count = ref_count + 1, status = ?, updated_at = ? WHERE digest = ?",
                )
                .bind(BLOB_STATUS_READY)
                .bind(&now)
                .bind(digest)
                .execute(db.pool())
                .await?;

                let blob = Self::get(db, digest).await?.ok_or_else(|| {
                    AppError::Inconsistent(format!("Blob {} vanished during commit", digest))
                })?;
                tracing::debug!("Created blob {} at {}", digest, blob.location);
                Ok((blob, true))
            }
            Err(e) => {
                // The pending row is still unreferenced unless a concurrent
                // duplicate already bumped it; only the unreferenced case is
                // ours to undo here.
                sqlx::query(
                    "DELETE FROM blobs WHERE digest = ? AND ref_count = 0 AND status = ?",
                )
                .bind(digest)
                .bind(BLOB_STATUS_PENDING)
                .execute(db.pool())
                .await?;
                hasher::cleanup_temp(temp_path).await;
                Err(e)
            }
        }
    }

    /// Drop one reference to the blob, reclaiming storage and row once no
    /// references remain. Invoked once per record deletion.
    ///
    /// Decrement, re-check and row delete share one transaction, so a
    /// concurrent resolve cannot re-reference the blob between the check and
    /// the destructive delete. Bytes go before the row: a crash in between
    /// leaves an orphaned row for the sweep, never unreachable bytes.
    pub async fn release(db: &Database, provider: &dyn StorageProvider, digest: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = db.pool().begin().await?;

        let affected = sqlx::query(
            "UPDATE blobs SET ref_count = ref_count - 1, updated_at = ? WHERE digest = ?",
        )
        .bind(&now)
        .bind(digest)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tracing::warn!("Release for unknown blob {}", digest);
            tx.commit().await?;
            return Ok(());
        }

        let blob: Option<Blob> = sqlx::query_as("SELECT * FROM blobs WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(blob) = blob {
            if blob.ref_count <= 0 {
                if let Err(e) = provider.delete(&blob.location).await {
                    // Keep the decrement; the zero-ref row stays visible for
                    // the reconciliation sweep.
                    tx.commit().await?;
                    return Err(e);
                }
                sqlx::query("DELETE FROM blobs WHERE digest = ? AND ref_count <= 0")
                    .bind(digest)
                    .execute(&mut *tx)
                    .await?;
                tracing::info!("Reclaimed blob {} ({} bytes)", digest, blob.size);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Sweep recoverable inconsistencies: unreferenced rows older than the
    /// grace period (pending rows whose writer crashed before the bytes
    /// landed, or ready rows whose reclaim was interrupted). Referenced rows
    /// stuck in pending are reported, never deleted.
    pub async fn reconcile(
        db: &Database,
        provider: &dyn StorageProvider,
        grace: chrono::Duration,
    ) -> Result<u64> {
        let cutoff = (Utc::now() - grace).to_rfc3339();

        let stale: Vec<Blob> = sqlx::query_as(
            "SELECT * FROM blobs WHERE ref_count <= 0 AND created_at < ?",
        )
        .bind(&cutoff)
        .fetch_all(db.pool())
        .await?;

        let mut reclaimed = 0u64;
        for blob in stale {
            if let Err(e) = provider.delete(&blob.location).await {
                tracing::warn!("Reconcile failed to delete bytes for {}: {}", blob.digest, e);
                continue;
            }
            let deleted = sqlx::query("DELETE FROM blobs WHERE digest = ? AND ref_count <= 0")
                .bind(&blob.digest)
                .execute(db.pool())
                .await?
                .rows_affected();
            if deleted > 0 {
                reclaimed += 1;
                tracing::info!(
                    "Reconciled stale {} blob {} ({} bytes)",
                    blob.status,
                    blob.digest,
                    blob.size
                );
            }
        }

        let (stuck,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM blobs WHERE status = ? AND ref_count > 0 AND created_at < ?",
        )
        .bind(BLOB_STATUS_PENDING)
        .bind(&cutoff)
        .fetch_one(db.pool())
        .await?;
        if stuck > 0 {
            tracing::error!(
                "{} referenced blob(s) stuck in pending state; manual reconciliation required",
                stuck
            );
        }

        Ok(reclaimed)
    }

    /// Deduplication statistics over the whole store.
    pub async fn stats(db: &Database) -> Result<StorageStats> {
        let (reported_total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(b.size), 0) FROM files f JOIN blobs b ON b.digest = f.digest",
        )
        .fetch_one(db.pool())
        .await?;

        let (physical_total,): (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(size), 0) FROM blobs")
                .fetch_one(db.pool())
                .await?;

        let dedup_ratio = if reported_total > 0 {
            let ratio = 1.0 - (physical_total as f64 / reported_total as f64);
            (ratio * 1_000_000.0).round() / 1_000_000.0
        } else {
            0.0
        };

        Ok(StorageStats {
            reported_total,
            physical_total,
            savings: reported_total - physical_total,
            dedup_ratio,
        })
    }
}
