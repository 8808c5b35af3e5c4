//! Archive in a local directory tree.

use super::{validate_key, BlobError, BlobStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Stores each key as a file below `root`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (and create) the archive root.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, BlobError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: std::fs::canonicalize(root)?,
        })
    }

    /// Directory holding the archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        validate_key(key)?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}{}", key_prefix, name);
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), format!("{}/", key)));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn url_for(&self, key: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        Ok(format!("file://{}", self.path_for(key).display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_writes_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        store
            .put("task/kvnode-1/docker-logs-kvnode.out.txt", b"hello".to_vec())
            .await
            .unwrap();

        let written = store
            .root()
            .join("task")
            .join("kvnode-1")
            .join("docker-logs-kvnode.out.txt");
        assert_eq!(std::fs::read(written).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("t1/a/x.out.txt", Vec::new()).await.unwrap();
        store.put("t1/b/y.err.txt", Vec::new()).await.unwrap();
        store.put("t2/a/z.out.txt", Vec::new()).await.unwrap();

        assert_eq!(
            store.list("t1/").await.unwrap(),
            vec!["t1/a/x.out.txt".to_string(), "t1/b/y.err.txt".to_string()]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn put_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("logs")).unwrap();
        assert!(matches!(
            store.put("../outside.txt", b"x".to_vec()).await,
            Err(BlobError::InvalidKey(_))
        ));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn url_points_into_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(store.url_for("../x").await.is_err());
        let url = store.url_for("t/i/f.txt").await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("f.txt"));
    }
}
