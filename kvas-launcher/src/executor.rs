//! Runs commands on leased machines.
//!
//! One command at a time per lease: every call holds the lease's channel
//! lock for its whole duration. Different leases run in parallel.
//!
//! With capture on, a command's stdout and stderr are redirected into two
//! files on the machine (see [`CapturePlan`]), read back over the same
//! channel and archived under `task_id/instance/file`, whether the command
//! succeeded or not.

use kvas_core::capture::STDERR_EXCERPT_BYTES;
use kvas_core::{blob_key, stderr_excerpt, CapturePlan};
use std::sync::Arc;
use std::time::Duration;

use crate::blob::BlobStore;
use crate::error::ExecError;
use crate::ssh::{CommandOutput, SshConnector, SshSession};
use crate::vm::VmLease;

type Channel = Option<Box<dyn SshSession>>;

/// Remote command runner with connection retry and log capture.
pub struct RemoteExecutor {
    connector: Arc<dyn SshConnector>,
    blobs: Arc<dyn BlobStore>,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor {
    /// Create an executor.
    pub fn new(
        connector: Arc<dyn SshConnector>,
        blobs: Arc<dyn BlobStore>,
        connect_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            connector,
            blobs,
            connect_attempts: connect_attempts.max(1),
            retry_delay,
        }
    }

    /// Run one command on `lease`, reusing its channel.
    ///
    /// # Errors
    ///
    /// [`ExecError::Connection`] if no channel could be opened,
    /// [`ExecError::Command`] on a non-zero exit, [`ExecError::Channel`] if
    /// the transport broke, [`ExecError::Upload`] if the command succeeded
    /// but its captured output could not be archived.
    pub async fn run(&self, lease: &VmLease, command: &str, capture: bool) -> Result<(), ExecError> {
        let mut channel = lease.channel().lock().await;
        self.run_locked(lease, &mut channel, command, capture).await
    }

    /// Run `commands` in order, stopping at the first failure.
    ///
    /// The lease's channel is closed before returning, on success and on
    /// failure.
    pub async fn run_sequence(
        &self,
        lease: &VmLease,
        commands: &[String],
        capture: bool,
    ) -> Result<(), ExecError> {
        let mut channel = lease.channel().lock().await;

        let mut result = Ok(());
        for command in commands {
            result = self.run_locked(lease, &mut channel, command, capture).await;
            if result.is_err() {
                break;
            }
        }

        if let Some(mut session) = channel.take() {
            if let Err(e) = session.close().await {
                tracing::warn!(instance = %lease.instance(), error = %e, "closing channel failed");
            }
        }
        result
    }

    async fn run_locked(
        &self,
        lease: &VmLease,
        channel: &mut Channel,
        command: &str,
        capture: bool,
    ) -> Result<(), ExecError> {
        if !capture {
            let output = self.exec(lease, channel, command).await?;
            return check(lease, command, &output, &output.stderr);
        }

        let plan = CapturePlan::new(command);
        let outcome = match self.exec(lease, channel, &plan.wrapped).await {
            // Nothing ran, so there is nothing to archive.
            Err(e @ ExecError::Connection { .. }) => return Err(e),
            outcome => outcome,
        };

        let captured_stderr = self.archive(lease, channel, &plan).await;

        let result = outcome.and_then(|output| {
            let stderr = captured_stderr.as_deref().unwrap_or(&[]);
            check(lease, command, &output, stderr)
        });

        match (result, captured_stderr) {
            (Ok(()), Err(upload)) => Err(upload),
            (result, _) => result,
        }
    }

    /// Read back and upload both capture files. Returns the captured stderr.
    async fn archive(
        &self,
        lease: &VmLease,
        channel: &mut Channel,
        plan: &CapturePlan,
    ) -> Result<Vec<u8>, ExecError> {
        let mut first_error = None;
        let mut stderr = Vec::new();

        for file in [&plan.stdout_file, &plan.stderr_file] {
            let key = blob_key(lease.task_id(), lease.instance(), file);
            match self.upload(lease, channel, file, &key).await {
                Ok(data) => {
                    if file == &plan.stderr_file {
                        stderr = data;
                    }
                }
                Err(e) => {
                    tracing::error!(instance = %lease.instance(), key = %key, error = %e, "log upload failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stderr),
        }
    }

    async fn upload(
        &self,
        lease: &VmLease,
        channel: &mut Channel,
        file: &str,
        key: &str,
    ) -> Result<Vec<u8>, ExecError> {
        let upload_error = |reason: String| ExecError::Upload {
            instance: lease.instance().to_string(),
            key: key.to_string(),
            reason,
        };

        let output = self
            .exec(lease, channel, &CapturePlan::read_back(file))
            .await
            .map_err(|e| upload_error(format!("read back failed: {}", e)))?;
        if !output.success() {
            return Err(upload_error(format!(
                "read back exited with code {}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.blobs
            .put(key, output.stdout.clone())
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        tracing::debug!(instance = %lease.instance(), key, "log archived");
        Ok(output.stdout)
    }

    /// Run `command` on the lease's channel, opening one if needed.
    ///
    /// The session is held outside the slot while the command runs; it is
    /// put back only if the transport survived.
    async fn exec(
        &self,
        lease: &VmLease,
        channel: &mut Channel,
        command: &str,
    ) -> Result<CommandOutput, ExecError> {
        let mut session = match channel.take() {
            Some(session) => session,
            None => self.connect(lease).await?,
        };

        tracing::debug!(instance = %lease.instance(), command, "running command");
        match session.exec(command).await {
            Ok(output) => {
                *channel = Some(session);
                Ok(output)
            }
            Err(e) => Err(ExecError::Channel {
                instance: lease.instance().to_string(),
                source: e,
            }),
        }
    }

    async fn connect(&self, lease: &VmLease) -> Result<Box<dyn SshSession>, ExecError> {
        let max_attempts = self.connect_attempts;
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            match self.connector.connect(lease.external_address()).await {
                Ok(session) => {
                    tracing::debug!(instance = %lease.instance(), attempt, "channel open");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(
                        instance = %lease.instance(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "could not establish ssh connection"
                    );
                    last = e.to_string();
                    if attempt < max_attempts && !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(ExecError::Connection {
            instance: lease.instance().to_string(),
            attempts: max_attempts,
            last,
        })
    }
}

fn check(
    lease: &VmLease,
    command: &str,
    output: &CommandOutput,
    stderr: &[u8],
) -> Result<(), ExecError> {
    if output.success() {
        tracing::info!(
            instance = %lease.instance(),
            command,
            out = %String::from_utf8_lossy(&output.stdout).trim(),
            "command finished"
        );
        return Ok(());
    }

    let excerpt = stderr_excerpt(&String::from_utf8_lossy(stderr), STDERR_EXCERPT_BYTES);
    tracing::error!(
        instance = %lease.instance(),
        command,
        exit_code = output.exit_code,
        err = %excerpt,
        "command failed"
    );
    Err(ExecError::Command {
        instance: lease.instance().to_string(),
        command: command.to_string(),
        exit_code: output.exit_code,
        stderr_excerpt: excerpt,
    })
}
