//! Log archive storage.
//!
//! Captured command output is stored under `task_id/instance/file` keys.
//! Keys are always `/`-separated regardless of backend.

mod fs;
mod gcs;
mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

pub use fs::FsBlobStore;
pub use gcs::GcsBlobStore;
pub use memory::MemoryBlobStore;

/// Errors from the log archive.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key is empty, absolute or escapes the archive root.
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    /// The storage service rejected the request.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Archive for captured logs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;

    /// Location a reader can fetch `key` from.
    async fn url_for(&self, key: &str) -> Result<String, BlobError>;
}

/// Reject keys that are empty, absolute, or contain empty, `.` or `..`
/// segments.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

/// Build the store selected by `config`.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, BlobError> {
    let store: Arc<dyn BlobStore> = match config.backend {
        StorageBackend::Fs => Arc::new(FsBlobStore::new(&config.root)?),
        StorageBackend::Gcs => Arc::new(
            GcsBlobStore::new(&config.bucket)
                .with_signing(config.url_ttl(), config.signing_account.clone()),
        ),
    };
    Ok(store)
}
