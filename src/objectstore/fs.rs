//! Filesystem-backed object store with signed access URLs.
//!
//! Blobs live under `root/bucket/key`. Presigned URLs carry an expiry
//! timestamp and a SHA-256 signature over `secret|bucket|key|expiry`, so a
//! URL is only honored while the signature matches and the expiry has not
//! passed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ObjectStoreError;

use super::ObjectStore;

/// Object store rooted at a local directory.
pub struct FsObjectStore {
    root: PathBuf,
    secret: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            secret: secret.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn signature(&self, bucket: &str, key: &str, expires_at: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires_at.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verifies a signature produced by [`presign`](ObjectStore::presign).
    pub fn verify_signature(
        &self,
        bucket: &str,
        key: &str,
        expires_at: i64,
        signature: &str,
    ) -> bool {
        expires_at > Utc::now().timestamp() && self.signature(bucket, key, expires_at) == signature
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.blob_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.blob_path(bucket, key);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                ObjectStoreError::Io(e)
            }
        })
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, ObjectStoreError> {
        let path = self.blob_path(bucket, key);
        if !path.exists() {
            return Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let expires_at = Utc::now().timestamp() + expires_secs as i64;
        let signature = self.signature(bucket, key, expires_at);
        Ok(format!(
            "file://{}?expires={expires_at}&signature={signature}",
            path.display()
        ))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.blob_path(bucket, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::Io(e)),
        }
    }
}
