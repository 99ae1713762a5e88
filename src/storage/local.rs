use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use crate::storage::StorageProvider;

/// Local file system storage provider
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            base_path: PathBuf::from(&config.local_path),
        }
    }

    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, location: &str) -> PathBuf {
        self.base_path.join(location)
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn put_file(&self, location: &str, local_path: &Path) -> Result<Option<String>> {
        let full_path = self.full_path(location);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&full_path).await? {
            // Another writer already materialized this content; drop ours.
            fs::remove_file(local_path).await?;
            return Ok(None);
        }

        // Prefer a rename; fall back to copy+remove across filesystems.
        match fs::rename(local_path, &full_path).await {
            Ok(()) => {}
            Err(_) => {
                fs::copy(local_path, &full_path).await?;
                fs::remove_file(local_path).await?;
            }
        }

        tracing::debug!("Stored blob at {:?}", full_path);
        Ok(None)
    }

    async fn get(&self, location: &str) -> Result<Bytes> {
        let full_path = self.full_path(location);

        let data = fs::read(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("Object not found: {}", location))
            } else {
                AppError::Storage(format!("Failed to read object: {}", e))
            }
        })?;

        Ok(Bytes::from(data))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let full_path = self.full_path(location);

        if fs::try_exists(&full_path).await? {
            fs::remove_file(&full_path).await?;
            tracing::debug!("Deleted blob {:?}", full_path);

            // Remove now-empty hash-prefix directories up to the base path
            let mut current_dir = full_path.parent().map(|p| p.to_path_buf());
            while let Some(dir) = current_dir {
                if dir == self.base_path {
                    break;
                }
                match fs::read_dir(&dir).await {
                    Ok(mut entries) => {
                        if entries.next_entry().await?.is_some() {
                            break; // Not empty
                        }
                        let _ = fs::remove_dir(&dir).await;
                    }
                    Err(_) => break,
                }
                current_dir = dir.parent().map(|p| p.to_path_buf());
            }
        }

        Ok(())
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(location)).await?)
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}
