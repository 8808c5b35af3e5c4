//! Error types for kvas-launcher.

use kvas_core::TransitionError;
use kvas_types::{TaskId, TypesError, VmRole};
use std::path::PathBuf;

use crate::blob::BlobError;
use crate::ssh::SshError;

/// Startup errors of the launcher service.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Log archive could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] BlobError),

    /// The SSH public key installed on instances could not be read.
    #[error("failed to read SSH public key {path}: {source}")]
    PublicKey {
        /// Path of the `.pub` file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while acquiring or releasing a machine.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The cloud rejected an instance operation.
    #[error("{operation} of instance {instance} failed: {reason}")]
    Backend {
        /// `create`, `describe` or `delete`.
        operation: &'static str,
        /// Instance name.
        instance: String,
        /// Diagnostics from the backend.
        reason: String,
    },

    /// The instance exists but its addresses never became readable.
    #[error("instance {instance} not ready after {attempts} attempts: {last}")]
    Exhausted {
        /// Instance name.
        instance: String,
        /// Attempts made.
        attempts: u32,
        /// Last lookup error.
        last: String,
    },

    /// Acquisition took longer than its deadline.
    #[error("acquiring a {role} instance ({instance}) timed out after {secs}s")]
    Timeout {
        /// Role being acquired.
        role: VmRole,
        /// Instance name.
        instance: String,
        /// Deadline in seconds.
        secs: u64,
    },
}

/// Errors running a command on a machine.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// No channel could be opened.
    #[error("could not connect to {instance} after {attempts} attempts: {last}")]
    Connection {
        /// Instance name.
        instance: String,
        /// Attempts made.
        attempts: u32,
        /// Last connection error.
        last: String,
    },

    /// The command ran and exited non-zero.
    #[error("{instance} - `{command}` exited with code {exit_code}: {stderr_excerpt}")]
    Command {
        /// Instance name.
        instance: String,
        /// The command as requested (before capture wrapping).
        command: String,
        /// Exit code.
        exit_code: i32,
        /// Tail of the command's stderr.
        stderr_excerpt: String,
    },

    /// The channel broke while a command was in flight.
    #[error("channel to {instance} failed: {source}")]
    Channel {
        /// Instance name.
        instance: String,
        /// Transport error.
        source: SshError,
    },

    /// Captured output could not be archived.
    #[error("archiving {key} from {instance} failed: {reason}")]
    Upload {
        /// Instance name.
        instance: String,
        /// Archive key.
        key: String,
        /// What went wrong.
        reason: String,
    },
}

/// Task registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Illegal lifecycle transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The node list is written exactly once.
    #[error("nodes of task {0} are already recorded")]
    NodesAlreadySet(TaskId),
}

/// Why a task run failed.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Launch parameters were rejected.
    #[error("invalid launch request: {0}")]
    InvalidRequest(#[from] TypesError),

    /// A machine could not be acquired.
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    /// A remote command failed.
    #[error("remote execution failed: {0}")]
    Exec(#[from] ExecError),

    /// Registry update was rejected.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Archived logs could not be listed.
    #[error("log archive error: {0}")]
    Logs(#[from] BlobError),

    /// The run exceeded its deadline.
    #[error("task timed out after {secs}s")]
    TimedOut {
        /// Deadline in seconds.
        secs: u64,
    },

    /// The run was cancelled.
    #[error("task cancelled")]
    Cancelled,

    /// The launcher is shutting down and takes no new tasks.
    #[error("launcher is shutting down")]
    ShuttingDown,

    /// The run's tokio task panicked or was aborted.
    #[error("task run aborted: {0}")]
    Panicked(String),
}

/// Result type alias for launcher startup.
pub type Result<T> = std::result::Result<T, LauncherError>;
