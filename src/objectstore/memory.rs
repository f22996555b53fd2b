//! In-memory object store for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ObjectStoreError;

use super::ObjectStore;

/// Blob store backed by a `RwLock`-guarded map.
#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), ObjectStoreError> {
        self.blobs
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.blobs
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        expires_secs: u64,
    ) -> Result<String, ObjectStoreError> {
        if !self
            .blobs
            .read()
            .await
            .contains_key(&(bucket.to_string(), key.to_string()))
        {
            return Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(format!("memory://{bucket}/{key}?expires={expires_secs}"))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.blobs
            .write()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryObjectStore::new();
        store.put("b", "k", b"data").await.unwrap();
        assert_eq!(store.get("b", "k").await.unwrap(), b"data");

        store.delete("b", "k").await.unwrap();
        assert!(store.get("b", "k").await.is_err());
        // Deleting an absent blob is fine.
        store.delete("b", "k").await.unwrap();
    }

    #[tokio::test]
    async fn test_presign_requires_existing_blob() {
        let store = MemoryObjectStore::new();
        assert!(store.presign("b", "k", 60).await.is_err());
        store.put("b", "k", b"data").await.unwrap();
        let url = store.presign("b", "k", 60).await.unwrap();
        assert!(url.contains("b/k"));
    }
}
