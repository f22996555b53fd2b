//! Blob storage for point-cloud payloads and stage outputs.
//!
//! The pipeline consumes blob storage through the [`ObjectStore`] trait over
//! `(bucket, key)` pairs. Artifact rows reference blobs by `s3://bucket/key`
//! URIs. Transient failures are retried with capped exponential backoff via
//! [`put_with_retry`] / [`get_with_retry`]; non-transient failures surface
//! immediately.

pub mod fs;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ObjectStoreError;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

/// Blob storage contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores a blob, creating the bucket if needed.
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), ObjectStoreError>;

    /// Fetches a blob.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Returns a signed access URL valid for `expires_secs` seconds.
    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, ObjectStoreError>;

    /// Removes a blob. Removing an absent blob is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}

/// Retry policy for transient object-store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `base * 2^(n-1)`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Builds an artifact URI for a stored blob.
pub fn object_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// Splits an `s3://bucket/key` URI into its parts.
pub fn parse_uri(uri: &str) -> Result<(&str, &str), ObjectStoreError> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| ObjectStoreError::InvalidUri(uri.to_string()))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| ObjectStoreError::InvalidUri(uri.to_string()))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(ObjectStoreError::InvalidUri(uri.to_string()));
    }
    Ok((bucket, key))
}

/// Stores a blob, retrying transient failures with exponential backoff.
pub async fn put_with_retry(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    data: &[u8],
    policy: RetryPolicy,
) -> Result<(), ObjectStoreError> {
    with_retry(policy, || store.put(bucket, key, data)).await
}

/// Fetches a blob, retrying transient failures with exponential backoff.
pub async fn get_with_retry(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    policy: RetryPolicy,
) -> Result<Vec<u8>, ObjectStoreError> {
    with_retry(policy, || store.get(bucket, key)).await
}

async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ObjectStoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ObjectStoreError>>,
{
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.base_delay * (1_u32 << (attempt - 1));
            tokio::time::sleep(delay).await;
            tracing::debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying object store operation after transient failure"
            );
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if matches!(err, ObjectStoreError::Transient(_)) {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "Transient object store error, will retry"
                    );
                    last_error = Some(err);
                } else {
                    return Err(err);
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| ObjectStoreError::Transient("retries exhausted".to_string())))
}
