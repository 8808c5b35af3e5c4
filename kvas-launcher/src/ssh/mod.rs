//! Remote shell capability.
//!
//! A [`SshConnector`] opens a [`SshSession`] to a host; the session runs one
//! command at a time and stays open until closed. [`openssh`] implements
//! both on top of the system `ssh` binary.

pub mod openssh;

use async_trait::async_trait;
use thiserror::Error;

pub use openssh::OpensshConnector;

/// Errors from the remote shell transport.
#[derive(Debug, Error)]
pub enum SshError {
    /// The ssh process could not be spawned.
    #[error("ssh spawn error: {0}")]
    Spawn(#[from] std::io::Error),

    /// No session could be established.
    #[error("ssh connection to {host} failed: {reason}")]
    Connect {
        /// Target host.
        host: String,
        /// Transport diagnostics.
        reason: String,
    },

    /// The session is gone.
    #[error("ssh session to {host} is closed")]
    Closed {
        /// Target host.
        host: String,
    },
}

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open remote shell.
#[async_trait]
pub trait SshSession: Send {
    /// Run `command` and wait for it to exit.
    ///
    /// A non-zero exit code is not an error here; errors mean the transport
    /// itself failed.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError>;

    /// Close the session.
    async fn close(&mut self) -> Result<(), SshError>;
}

/// Opens sessions with the launcher's credentials.
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Establish a session to `host`. Each call is a single attempt.
    async fn connect(&self, host: &str) -> Result<Box<dyn SshSession>, SshError>;
}
