//! Sessions over the system `ssh` binary.
//!
//! `connect` starts an OpenSSH control master (`-M -fN`) bound to a private
//! socket; every `exec` is a short-lived `ssh -S <socket>` client
//! multiplexed over it, so one authenticated connection serves all the
//! commands of a session. `close` sends `-O exit` to the master.

use super::{CommandOutput, SshConnector, SshError, SshSession};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit status ssh itself uses for transport errors.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Connector holding the launcher's SSH credentials.
#[derive(Debug, Clone)]
pub struct OpensshConnector {
    login: String,
    key_file: PathBuf,
    port: u16,
    connect_timeout: Duration,
    control_dir: PathBuf,
}

impl OpensshConnector {
    /// Create a connector.
    pub fn new(
        login: impl Into<String>,
        key_file: impl Into<PathBuf>,
        port: u16,
        connect_timeout: Duration,
        control_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            login: login.into(),
            key_file: key_file.into(),
            port,
            connect_timeout,
            control_dir: control_dir.into(),
        }
    }

    fn master_args(&self, socket: &Path, log_file: &Path, host: &str) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            socket.display().to_string(),
            "-fN".to_string(),
            "-E".to_string(),
            log_file.display().to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            self.key_file.display().to_string(),
        ];
        args.extend(common_args(self.port));
        args.push(format!("{}@{}", self.login, host));
        args
    }
}

fn common_args(port: u16) -> Vec<String> {
    vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-p".to_string(),
        port.to_string(),
    ]
}

#[async_trait]
impl SshConnector for OpensshConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn SshSession>, SshError> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let socket = self.control_dir.join(format!("{}.sock", &id[..16]));
        let log_file = self.control_dir.join(format!("{}.log", &id[..16]));

        // The forked master keeps inherited pipes open, so its diagnostics go
        // to a log file instead.
        let status = Command::new("ssh")
            .args(self.master_args(&socket, &log_file, host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        let diagnostics = tokio::fs::read_to_string(&log_file)
            .await
            .unwrap_or_default();
        let _ = tokio::fs::remove_file(&log_file).await;

        if !status.success() {
            return Err(SshError::Connect {
                host: host.to_string(),
                reason: match diagnostics.trim() {
                    "" => format!("ssh exited with {}", status),
                    text => text.to_string(),
                },
            });
        }

        tracing::debug!(host, socket = %socket.display(), "ssh control master up");
        Ok(Box::new(OpensshSession {
            host: host.to_string(),
            destination: format!("{}@{}", self.login, host),
            port: self.port,
            socket,
            open: true,
        }))
    }
}

/// One control-master connection.
#[derive(Debug)]
pub struct OpensshSession {
    host: String,
    destination: String,
    port: u16,
    socket: PathBuf,
    open: bool,
}

impl OpensshSession {
    fn client(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.socket)
            .args(common_args(self.port))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn master_alive(&self) -> bool {
        self.client()
            .args(["-O", "check", self.destination.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SshSession for OpensshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        if !self.open {
            return Err(SshError::Closed {
                host: self.host.clone(),
            });
        }

        let output = self
            .client()
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .output()
            .await?;

        let exit_code = output.status.code().unwrap_or(-1);
        // 255 is also a legal remote exit code; the master tells them apart.
        if exit_code == SSH_TRANSPORT_FAILURE && !self.master_alive().await {
            self.open = false;
            return Err(SshError::Closed {
                host: self.host.clone(),
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let output = self
            .client()
            .args(["-O", "exit", self.destination.as_str()])
            .output()
            .await?;
        let _ = tokio::fs::remove_file(&self.socket).await;
        if !output.status.success() {
            tracing::debug!(
                host = %self.host,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ssh control master already gone"
            );
        }
        Ok(())
    }
}

impl Drop for OpensshSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        // Dropped mid-command (task cancelled): stop the master without
        // waiting for it.
        let _ = std::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.socket)
            .args(["-O", "exit", self.destination.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}
