//! Remote object-store backend: a plain HTTP object service addressed as
//! `{endpoint}/{bucket}/{key}` with an HMAC-SHA256 request signature.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio_util::io::ReaderStream;

use crate::config::RemoteStorageConfig;
use crate::error::{AppError, Result};
use crate::storage::StorageProvider;

type HmacSha256 = Hmac<Sha256>;

/// Signature validity window in seconds.
const SIGN_VALID_SECONDS: i64 = 7200;

pub struct RemoteStorage {
    endpoint: String,
    bucket: String,
    prefix: String,
    access_key: String,
    secret_key: String,
    http: reqwest::Client,
}

impl RemoteStorage {
    pub fn new(config: &RemoteStorageConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Backend-normalized object key: `{prefix}/{location}`.
    fn object_key(&self, location: &str) -> String {
        let location = location.trim_start_matches('/');
        if location.starts_with(&format!("{}/", self.prefix)) {
            // Already normalized (stored location from an earlier upload)
            location.to_string()
        } else {
            format!("{}/{}", self.prefix, location)
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn auth_header(&self, method: &str, key: &str) -> String {
        let start = Utc::now().timestamp();
        let key_time = format!("{};{}", start, start + SIGN_VALID_SECONDS);
        sign(
            &self.access_key,
            &self.secret_key,
            method,
            &format!("/{}/{}", self.bucket, key),
            &key_time,
        )
    }
}

/// Two-stage signature: an HMAC of the validity window derives the signing
/// key, which signs a digest of the method and path.
fn sign(access_key: &str, secret_key: &str, method: &str, path: &str, key_time: &str) -> String {
    let sign_key = hmac_hex(secret_key.as_bytes(), key_time.as_bytes());

    let http_string = format!("{}\n{}\n", method.to_lowercase(), path);
    let http_digest = hex::encode(Sha256::digest(http_string.as_bytes()));
    let string_to_sign = format!("sha256\n{}\n{}\n", key_time, http_digest);

    let signature = hmac_hex(sign_key.as_bytes(), string_to_sign.as_bytes());
    format!(
        "q-sign-algorithm=sha256&q-ak={}&q-sign-time={}&q-key-time={}&q-signature={}",
        access_key, key_time, key_time, signature
    )
}

fn hmac_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl StorageProvider for RemoteStorage {
    async fn put_file(&self, location: &str, local_path: &Path) -> Result<Option<String>> {
        let key = self.object_key(location);
        let url = self.object_url(&key);

        let file = tokio::fs::File::open(local_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let resp = self
            .http
            .put(&url)
            .header(AUTHORIZATION, self.auth_header("put", &key))
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Remote upload failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(AppError::Storage(format!(
                "Remote upload failed with status {}",
                resp.status()
            )));
        }

        // Upload consumed the temp content; drop the local copy.
        if let Err(e) = tokio::fs::remove_file(local_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove temp file {:?}: {}", local_path, e);
            }
        }

        Ok(Some(key))
    }

    async fn get(&self, location: &str) -> Result<Bytes> {
        let key = self.object_key(location);
        let resp = self
            .http
            .get(self.object_url(&key))
            .header(AUTHORIZATION, self.auth_header("get", &key))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Remote read failed: {}", e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(AppError::NotFound(format!("Object not found: {}", key))),
            s if s.is_success() => resp
                .bytes()
                .await
                .map_err(|e| AppError::Storage(format!("Remote read failed: {}", e))),
            s => Err(AppError::Storage(format!(
                "Remote read failed with status {}",
                s
            ))),
        }
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let key = self.object_key(location);
        let resp = self
            .http
            .delete(self.object_url(&key))
            .header(AUTHORIZATION, self.auth_header("delete", &key))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Remote delete failed: {}", e)))?;

        // Deleting an absent object is not an error
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AppError::Storage(format!(
                "Remote delete failed with status {}",
                resp.status()
            )))
        }
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        let key = self.object_key(location);
        let resp = self
            .http
            .head(self.object_url(&key))
            .header(AUTHORIZATION, self.auth_header("head", &key))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Remote head failed: {}", e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(AppError::Storage(format!(
                "Remote head failed with status {}",
                s
            ))),
        }
    }

    fn storage_type(&self) -> &'static str {
        "remote"
    }
}
