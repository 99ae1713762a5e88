//! Streaming spool: write an incoming byte stream to a process-private temp
//! file while computing its SHA-256, without buffering the payload.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Outcome of spooling a source stream.
#[derive(Debug)]
pub struct SpooledUpload {
    pub temp_path: PathBuf,
    /// Lowercase hex SHA-256 of the streamed bytes.
    pub digest: String,
    pub size: u64,
}

/// Stream `source` into a temp file under `temp_dir`, hashing as it goes.
/// Aborts with `TooLarge` once more than `max_size` bytes arrive; any failure
/// removes the partial temp file before the error surfaces.
pub async fn spool_to_temp<S>(
    mut source: S,
    temp_dir: &Path,
    max_size: u64,
) -> Result<SpooledUpload>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    fs::create_dir_all(temp_dir).await?;
    let temp_path = temp_dir.join(format!("upload_{}.tmp", Uuid::new_v4()));

    let result = write_stream(&mut source, &temp_path, max_size).await;

    match result {
        Ok((digest, size)) => Ok(SpooledUpload {
            temp_path,
            digest,
            size,
        }),
        Err(e) => {
            cleanup_temp(&temp_path).await;
            Err(e)
        }
    }
}

async fn write_stream<S>(source: &mut S, temp_path: &Path, max_size: u64) -> Result<(String, u64)>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut file = fs::File::create(temp_path).await?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        if size > max_size {
            return Err(AppError::TooLarge(format!(
                "Upload exceeds maximum allowed size of {} bytes",
                max_size
            )));
        }
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Best-effort temp removal; an already-absent file is fine.
pub async fn cleanup_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove temp file {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn source_of(chunks: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn spools_and_hashes_chunked_input() {
        let dir = tempfile::tempdir().unwrap();
        let spooled = spool_to_temp(source_of(vec![b"hel", b"lo"]), dir.path(), 1024)
            .await
            .unwrap();

        assert_eq!(spooled.size, 5);
        // SHA-256 of "hello"
        assert_eq!(
            spooled.digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let on_disk = std::fs::read(&spooled.temp_path).unwrap();
        assert_eq!(on_disk, b"hello");
    }

    #[tokio::test]
    async fn oversize_stream_aborts_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let err = spool_to_temp(source_of(vec![b"0123456789"]), dir.path(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TooLarge(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn source_error_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(AppError::InvalidInput("client aborted".to_string())),
        ]);
        let err = spool_to_temp(source, dir.path(), 1024).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_stream_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let spooled = spool_to_temp(source_of(vec![]), dir.path(), 1024)
            .await
            .unwrap();
        assert_eq!(spooled.size, 0);
        // SHA-256 of the empty string
        assert_eq!(
            spooled.digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
