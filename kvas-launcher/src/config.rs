//! Configuration loading for kvas-launcher.
//!
//! Configuration is loaded from a TOML file (default: `kvas.toml`). Every
//! section and field has a default; the SSH credentials can also come from
//! the `SSH_LOGIN` and `SSH_FILE` environment variables.

use kvas_core::Recipe;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `ssh.login`.
pub const SSH_LOGIN_ENV: &str = "SSH_LOGIN";
/// Environment variable overriding `ssh.key_file`.
pub const SSH_FILE_ENV: &str = "SSH_FILE";

/// Root configuration for kvas-launcher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Cloud provisioning configuration.
    #[serde(default)]
    pub cloud: CloudConfig,
    /// Remote shell configuration.
    #[serde(default)]
    pub ssh: SshConfig,
    /// Log archive configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Task run limits.
    #[serde(default)]
    pub tasks: TasksConfig,
    /// Images and commands run on the machines.
    #[serde(default)]
    pub recipe: Recipe,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Cloud provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Project that owns the instances.
    #[serde(default = "default_project")]
    pub project: String,
    /// Zone instances are created in.
    #[serde(default = "default_zone")]
    pub zone: String,
    /// Machine type of every instance.
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    /// Boot disk image.
    #[serde(default = "default_source_image")]
    pub source_image: String,
    /// Boot disk size in GB (default: 20).
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u32,
    /// Service account attached to every instance.
    #[serde(default = "default_service_account")]
    pub service_account: Option<String>,
    /// Upper bound for one acquisition, creation included (default: 300s).
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Attempts to read a new instance's addresses (default: 3).
    #[serde(default = "default_attempts")]
    pub describe_attempts: u32,
    /// Delay after the first failed lookup, doubled each retry.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Remote shell configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Login name on every instance.
    #[serde(default)]
    pub login: Option<String>,
    /// Private key file; `<key_file>.pub` is installed on the instances.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// SSH port (default: 22).
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Connection attempts per channel (default: 3).
    #[serde(default = "default_attempts")]
    pub connect_attempts: u32,
    /// Timeout of one connection attempt (default: 30s).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Pause between connection attempts (default: 5000ms).
    #[serde(default = "default_connect_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Directory for control-master sockets.
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,
}

/// Where archived logs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local directory tree.
    Fs,
    /// Google Cloud Storage bucket.
    Gcs,
}

/// Log archive configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend (default: gcs).
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// Bucket for the gcs backend.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the fs backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Lifetime of signed log URLs handed out by the gcs backend
    /// (default: 10800s).
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,
    /// Service account impersonated to sign URLs; the active gcloud
    /// credentials sign them when unset.
    #[serde(default)]
    pub signing_account: Option<String>,
}

/// Task run limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    /// Overall deadline of one task run (default: 3600s).
    #[serde(default = "default_task_timeout_secs")]
    pub timeout_secs: u64,
    /// Task runs provisioning at once (default: 4).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Largest node count one task may request (default: 32).
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_project() -> String {
    "kvas-loadtester".to_string()
}

fn default_zone() -> String {
    "us-east1-b".to_string()
}

fn default_machine_type() -> String {
    "g1-small".to_string()
}

fn default_source_image() -> String {
    "projects/kvas-loadtester/global/images/kvnode-base-image".to_string()
}

fn default_disk_size_gb() -> u32 {
    20
}

fn default_service_account() -> Option<String> {
    Some("kvnode@kvas-loadtester.iam.gserviceaccount.com".to_string())
}

fn default_acquire_timeout_secs() -> u64 {
    300
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_connect_retry_delay_ms() -> u64 {
    5000
}

fn default_control_dir() -> PathBuf {
    std::env::temp_dir().join("kvas-ssh")
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Gcs
}

fn default_bucket() -> String {
    "kvas-loadtester-logs".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("kvas-logs")
}

fn default_url_ttl_secs() -> u64 {
    3 * 60 * 60
}

fn default_task_timeout_secs() -> u64 {
    3600 // 1 hour
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_nodes() -> u32 {
    32
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            zone: default_zone(),
            machine_type: default_machine_type(),
            source_image: default_source_image(),
            disk_size_gb: default_disk_size_gb(),
            service_account: default_service_account(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            describe_attempts: default_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            login: None,
            key_file: None,
            port: default_ssh_port(),
            connect_attempts: default_attempts(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_delay_ms: default_connect_retry_delay_ms(),
            control_dir: default_control_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            bucket: default_bucket(),
            root: default_storage_root(),
            url_ttl_secs: default_url_ttl_secs(),
            signing_account: None,
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_task_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            max_nodes: default_max_nodes(),
        }
    }
}

impl CloudConfig {
    /// Acquisition deadline as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl StorageConfig {
    /// Signed URL lifetime as a duration.
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }
}

impl TasksConfig {
    /// Task deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Overlay `SSH_LOGIN` / `SSH_FILE` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(SSH_LOGIN_ENV).ok(),
            std::env::var(SSH_FILE_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, login: Option<String>, key_file: Option<String>) {
        if let Some(login) = login.filter(|v| !v.is_empty()) {
            self.ssh.login = Some(login);
        }
        if let Some(key_file) = key_file.filter(|v| !v.is_empty()) {
            self.ssh.key_file = Some(PathBuf::from(key_file));
        }
    }

    /// Check that the launcher can actually run with this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the SSH login or key file is
    /// unset, and [`ConfigError::Invalid`] for values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.ssh.login.as_deref() {
            Some(login) if !login.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::Missing {
                    field: "ssh.login",
                    env: SSH_LOGIN_ENV,
                })
            }
        }
        if self.ssh.key_file.is_none() {
            return Err(ConfigError::Missing {
                field: "ssh.key_file",
                env: SSH_FILE_ENV,
            });
        }
        if self.ssh.connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "ssh.connect_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tasks.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "tasks.max_concurrent",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tasks.max_nodes == 0 {
            return Err(ConfigError::Invalid {
                field: "tasks.max_nodes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.storage.backend == StorageBackend::Gcs && self.storage.url_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.url_ttl_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.storage.backend == StorageBackend::Gcs && self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "storage.bucket",
                reason: "required by the gcs backend".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A required setting is absent.
    #[error("`{field}` is not set (config file or `{env}` env variable)")]
    Missing {
        /// Dotted config key.
        field: &'static str,
        /// Environment variable that can supply it.
        env: &'static str,
    },
    /// A setting has an unusable value.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Dotted config key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
