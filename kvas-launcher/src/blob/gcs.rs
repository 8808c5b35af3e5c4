//! Archive in a Google Cloud Storage bucket, via the `gcloud` CLI.
//!
//! The bucket is private; readers get V4 signed URLs.

use super::{validate_key, BlobError, BlobStore};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default lifetime of a signed URL.
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Stores each key as an object in one bucket.
#[derive(Debug, Clone)]
pub struct GcsBlobStore {
    bucket: String,
    url_ttl: Duration,
    signing_account: Option<String>,
}

impl GcsBlobStore {
    /// Use `bucket` (name only, no `gs://`).
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            url_ttl: DEFAULT_URL_TTL,
            signing_account: None,
        }
    }

    /// Sign URLs valid for `ttl`, impersonating `account` when given.
    pub fn with_signing(mut self, ttl: Duration, account: Option<String>) -> Self {
        self.url_ttl = ttl;
        self.signing_account = account;
        self
    }

    fn sign_args(&self, key: &str) -> Vec<String> {
        let mut args = vec![
            "storage".to_string(),
            "sign-url".to_string(),
            self.object_uri(key),
            format!("--duration={}s", self.url_ttl.as_secs().max(1)),
            "--http-verb=GET".to_string(),
            "--format=value(signed_url)".to_string(),
        ];
        if let Some(account) = &self.signing_account {
            args.push(format!("--impersonate-service-account={}", account));
        }
        args
    }

    fn object_uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, key)
    }

    /// Keys from `gcloud storage ls` output.
    fn parse_listing(&self, listing: &str) -> Vec<String> {
        let base = format!("gs://{}/", self.bucket);
        let mut keys: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter_map(|line| line.strip_prefix(&base))
            .filter(|key| !key.is_empty() && !key.ends_with('/') && !key.ends_with(':'))
            .map(str::to_string)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        validate_key(key)?;
        let uri = self.object_uri(key);
        let mut child = Command::new("gcloud")
            .args(["storage", "cp", "-", uri.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&data).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BlobError::Backend(format!(
                "upload of {} failed: {}",
                key,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let pattern = format!("{}**", self.object_uri(prefix));
        let output = Command::new("gcloud")
            .args(["storage", "ls", pattern.as_str()])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("matched no objects") {
                return Ok(Vec::new());
            }
            return Err(BlobError::Backend(format!(
                "listing {} failed: {}",
                prefix,
                stderr.trim()
            )));
        }

        Ok(self.parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn url_for(&self, key: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        let output = Command::new("gcloud")
            .args(self.sign_args(key))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(BlobError::Backend(format!(
                "signing {} failed: {}",
                key,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_signed_url(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            BlobError::Backend(format!("no signed URL in gcloud output for {}", key))
        })
    }
}

/// The signed URL from `gcloud storage sign-url` output, either the bare
/// `value(signed_url)` form or the default `signed_url: ...` listing.
fn parse_signed_url(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .map(|line| line.strip_prefix("signed_url:").map_or(line, str::trim))
        .find(|line| line.starts_with("https://"))
        .map(str::to_string)
}
