pub mod local;
pub mod provider;
pub mod remote;

pub use local::*;
pub use provider::*;
pub use remote::*;

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{AppError, Result};

/// Build the storage backend selected by configuration. The commit and GC
/// protocols are backend-agnostic; only construction differs.
pub fn build_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    match config.backend.as_str() {
        "local" => Ok(Arc::new(LocalStorage::new(config))),
        "remote" => {
            if config.remote.endpoint.is_empty() || config.remote.bucket.is_empty() {
                return Err(AppError::InvalidInput(
                    "Remote storage requires endpoint and bucket".to_string(),
                ));
            }
            Ok(Arc::new(RemoteStorage::new(&config.remote)))
        }
        other => Err(AppError::InvalidInput(format!(
            "Unknown storage backend: {}",
            other
        ))),
    }
}
