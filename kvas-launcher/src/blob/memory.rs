//! In-memory archive.

use super::{validate_key, BlobError, BlobStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory blob store for testing.
///
/// Not persistent - all data is lost when the last clone is dropped.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs().get(key).cloned()
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.blobs().keys().cloned().collect()
    }

    /// Get the number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs().is_empty()
    }

    fn blobs(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        validate_key(key)?;
        self.blobs().insert(key.to_string(), data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        Ok(self
            .blobs()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn url_for(&self, key: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        Ok(format!("memory:///{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list() {
        let store = MemoryBlobStore::new();
        store.put("t1/vm/b.txt", b"b".to_vec()).await.unwrap();
        store.put("t1/vm/a.txt", b"a".to_vec()).await.unwrap();
        store.put("t2/vm/c.txt", b"c".to_vec()).await.unwrap();

        assert_eq!(store.get("t1/vm/a.txt"), Some(b"a".to_vec()));
        assert_eq!(
            store.list("t1/").await.unwrap(),
            vec!["t1/vm/a.txt".to_string(), "t1/vm/b.txt".to_string()]
        );
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn clones_share_contents() {
        let store = MemoryBlobStore::new();
        let other = store.clone();
        store.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(other.keys(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn rejects_invalid_keys() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.put("../x", Vec::new()).await,
            Err(BlobError::InvalidKey(_))
        ));
        assert!(store.is_empty());
    }
}
