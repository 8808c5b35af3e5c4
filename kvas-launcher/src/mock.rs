//! In-process doubles for the cloud, the remote shell and the log archive.
//!
//! [`MockRig`] wires them into a [`Launcher`] so the whole task state machine
//! can run in tests without touching real infrastructure.

use async_trait::async_trait;
use kvas_core::{Recipe, RetryPolicy};
use kvas_types::VmRole;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::blob::MemoryBlobStore;
use crate::error::ProvisionError;
use crate::executor::RemoteExecutor;
use crate::registry::TaskRegistry;
use crate::ssh::{CommandOutput, SshConnector, SshError, SshSession};
use crate::task::{Launcher, TaskSettings};
use crate::vm::{CloudBackend, InstanceAddresses, InstanceRequest, VmProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Mock cloud.
///
/// Hands out sequential addresses and records every create and delete.
#[derive(Debug, Default, Clone)]
pub struct MockCloud {
    inner: Arc<Mutex<MockCloudInner>>,
}

#[derive(Debug, Default)]
struct MockCloudInner {
    next_address: u32,
    live: HashMap<String, InstanceAddresses>,
    created: Vec<String>,
    deleted: Vec<String>,
    creates_per_role: HashMap<VmRole, usize>,
    failing_creates: Vec<(VmRole, usize)>,
    failing_describes: u32,
    describe_calls: u32,
    delete_calls: u32,
    fail_deletes: bool,
    create_delay: Duration,
}

impl MockCloud {
    /// Create a new mock cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` (0-based) creation for `role` fail.
    pub fn fail_create(&self, role: VmRole, nth: usize) {
        lock(&self.inner).failing_creates.push((role, nth));
    }

    /// Make the next `count` address lookups fail.
    pub fn fail_describe(&self, count: u32) {
        lock(&self.inner).failing_describes = count;
    }

    /// Make every deletion fail.
    pub fn fail_deletes(&self) {
        lock(&self.inner).fail_deletes = true;
    }

    /// Delay the return of every creation. The instance exists from the
    /// start of the call.
    pub fn set_create_delay(&self, delay: Duration) {
        lock(&self.inner).create_delay = delay;
    }

    /// Names of created instances, in creation order.
    pub fn created(&self) -> Vec<String> {
        lock(&self.inner).created.clone()
    }

    /// Names of deleted instances, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.inner).deleted.clone()
    }

    /// Names of instances that exist right now, sorted.
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner).live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of address lookups so far.
    pub fn describe_calls(&self) -> u32 {
        lock(&self.inner).describe_calls
    }

    /// Number of deletion requests so far, failed ones included.
    pub fn delete_calls(&self) -> u32 {
        lock(&self.inner).delete_calls
    }
}

#[async_trait]
impl CloudBackend for MockCloud {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<(), ProvisionError> {
        let delay = {
            let mut inner = lock(&self.inner);
            let count = inner.creates_per_role.entry(request.role).or_insert(0);
            let index = *count;
            *count += 1;
            if inner.failing_creates.contains(&(request.role, index)) {
                return Err(ProvisionError::Backend {
                    operation: "create",
                    instance: request.name.clone(),
                    reason: "QUOTA_EXCEEDED".to_string(),
                });
            }

            inner.next_address += 1;
            let n = inner.next_address;
            let addresses = InstanceAddresses {
                internal: format!("10.0.{}.{}", n / 256, n % 256),
                external: format!("34.0.{}.{}", n / 256, n % 256),
            };
            inner.live.insert(request.name.clone(), addresses);
            inner.created.push(request.name.clone());
            inner.create_delay
        };

        // The instance already exists while the operation is pending.
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn describe_instance(&self, name: &str) -> Result<InstanceAddresses, ProvisionError> {
        let mut inner = lock(&self.inner);
        inner.describe_calls += 1;
        let backend_error = |reason: &str| ProvisionError::Backend {
            operation: "describe",
            instance: name.to_string(),
            reason: reason.to_string(),
        };
        if inner.failing_describes > 0 {
            inner.failing_describes -= 1;
            return Err(backend_error("not ready"));
        }
        inner
            .live
            .get(name)
            .cloned()
            .ok_or_else(|| backend_error("not found"))
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ProvisionError> {
        let mut inner = lock(&self.inner);
        inner.delete_calls += 1;
        let backend_error = |reason: &str| ProvisionError::Backend {
            operation: "delete",
            instance: name.to_string(),
            reason: reason.to_string(),
        };
        if inner.fail_deletes {
            return Err(backend_error("permission denied"));
        }
        if inner.live.remove(name).is_none() {
            return Err(backend_error("not found"));
        }
        inner.deleted.push(name.to_string());
        Ok(())
    }
}

/// Mock remote shell.
///
/// Every command succeeds with `"<command>: ok\n"` on stdout unless a
/// failure is scripted. Captured commands write their output to per-host
/// files that `cat -- <file>` reads back.
#[derive(Debug, Default, Clone)]
pub struct MockSsh {
    inner: Arc<Mutex<MockSshInner>>,
}

#[derive(Debug, Default)]
struct MockSshInner {
    failing_connects: u32,
    refuse_all: bool,
    connects: Vec<String>,
    sessions_opened: u32,
    sessions_closed: u32,
    commands: Vec<(String, String)>,
    failures: Vec<(String, i32, String)>,
    blocked: Vec<String>,
    files: HashMap<(String, String), Vec<u8>>,
}

impl MockSsh {
    /// Create a new mock shell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.inner).failing_connects = count;
    }

    /// Make every connection attempt fail.
    pub fn refuse_connections(&self) {
        lock(&self.inner).refuse_all = true;
    }

    /// Commands containing `pattern` exit with `exit_code` and `stderr`.
    pub fn fail_command(&self, pattern: &str, exit_code: i32, stderr: &str) {
        lock(&self.inner)
            .failures
            .push((pattern.to_string(), exit_code, stderr.to_string()));
    }

    /// Commands containing `pattern` never finish.
    pub fn block_command(&self, pattern: &str) {
        lock(&self.inner).blocked.push(pattern.to_string());
    }

    /// Every `(host, command)` executed, in order.
    pub fn commands(&self) -> Vec<(String, String)> {
        lock(&self.inner).commands.clone()
    }

    /// Executed commands containing `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<(String, String)> {
        lock(&self.inner)
            .commands
            .iter()
            .filter(|(_, command)| command.contains(pattern))
            .cloned()
            .collect()
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        lock(&self.inner).connects.len()
    }

    /// Sessions opened and not yet closed or dropped.
    pub fn open_sessions(&self) -> u32 {
        let inner = lock(&self.inner);
        inner.sessions_opened - inner.sessions_closed
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> u32 {
        lock(&self.inner).sessions_opened
    }
}

fn unquote(word: &str) -> String {
    match word.strip_prefix('\'').and_then(|w| w.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => word.to_string(),
    }
}

/// Split `( cmd ) > out 2> err` into its parts.
fn parse_capture(command: &str) -> Option<(&str, String, String)> {
    let rest = command.strip_prefix("( ")?;
    let split = rest.rfind(" ) > ")?;
    let (stdout_file, stderr_file) = rest[split + 5..].split_once(" 2> ")?;
    Some((&rest[..split], unquote(stdout_file), unquote(stderr_file)))
}

impl MockSshInner {
    fn respond(&mut self, host: &str, command: &str) -> CommandOutput {
        if let Some(file) = command.strip_prefix("cat -- ").map(unquote) {
            return match self.files.get(&(host.to_string(), file.clone())) {
                Some(data) => CommandOutput {
                    exit_code: 0,
                    stdout: data.clone(),
                    stderr: Vec::new(),
                },
                None => CommandOutput {
                    exit_code: 1,
                    stdout: Vec::new(),
                    stderr: format!("cat: {}: No such file or directory", file).into_bytes(),
                },
            };
        }

        let capture = parse_capture(command);
        let target = capture.as_ref().map(|(inner, _, _)| *inner).unwrap_or(command);
        let (exit_code, stderr) = self
            .failures
            .iter()
            .find(|(pattern, _, _)| target.contains(pattern.as_str()))
            .map(|(_, code, stderr)| (*code, stderr.clone()))
            .unwrap_or((0, String::new()));
        let stdout = if exit_code == 0 {
            format!("{}: ok\n", target).into_bytes()
        } else {
            Vec::new()
        };

        match capture {
            Some((_, stdout_file, stderr_file)) => {
                self.files.insert((host.to_string(), stdout_file), stdout);
                self.files
                    .insert((host.to_string(), stderr_file), stderr.into_bytes());
                CommandOutput {
                    exit_code,
                    ..CommandOutput::default()
                }
            }
            None => CommandOutput {
                exit_code,
                stdout,
                stderr: stderr.into_bytes(),
            },
        }
    }
}

#[async_trait]
impl SshConnector for MockSsh {
    async fn connect(&self, host: &str) -> Result<Box<dyn SshSession>, SshError> {
        let mut inner = lock(&self.inner);
        inner.connects.push(host.to_string());
        if inner.refuse_all || inner.failing_connects > 0 {
            inner.failing_connects = inner.failing_connects.saturating_sub(1);
            return Err(SshError::Connect {
                host: host.to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        inner.sessions_opened += 1;
        Ok(Box::new(MockSession {
            host: host.to_string(),
            inner: Arc::clone(&self.inner),
            open: true,
        }))
    }
}

struct MockSession {
    host: String,
    inner: Arc<Mutex<MockSshInner>>,
    open: bool,
}

#[async_trait]
impl SshSession for MockSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        if !self.open {
            return Err(SshError::Closed {
                host: self.host.clone(),
            });
        }
        let blocked = {
            let mut inner = lock(&self.inner);
            inner
                .commands
                .push((self.host.clone(), command.to_string()));
            inner.blocked.iter().any(|pattern| command.contains(pattern.as_str()))
        };
        if blocked {
            std::future::pending::<()>().await;
        }
        Ok(lock(&self.inner).respond(&self.host, command))
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if self.open {
            self.open = false;
            lock(&self.inner).sessions_closed += 1;
        }
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if self.open {
            lock(&self.inner).sessions_closed += 1;
        }
    }
}

/// A [`Launcher`] over mock capabilities, with zero retry delays.
pub struct MockRig {
    /// Mock cloud.
    pub cloud: MockCloud,
    /// Mock remote shell.
    pub ssh: MockSsh,
    /// Log archive.
    pub blobs: MemoryBlobStore,
    /// The launcher under test.
    pub launcher: Arc<Launcher>,
}

impl MockRig {
    /// Rig with default task settings.
    pub fn new() -> Self {
        Self::with_settings(TaskSettings::default())
    }

    /// Rig with custom task settings.
    pub fn with_settings(settings: TaskSettings) -> Self {
        let cloud = MockCloud::new();
        let ssh = MockSsh::new();
        let blobs = MemoryBlobStore::new();
        let provider = VmProvider::new(
            Arc::new(cloud.clone()),
            RetryPolicy::immediate(3),
            Duration::from_secs(5),
        );
        let executor =
            RemoteExecutor::new(Arc::new(ssh.clone()), Arc::new(blobs.clone()), 3, Duration::ZERO);
        let launcher = Launcher::new(
            Arc::new(TaskRegistry::new()),
            provider,
            executor,
            Arc::new(blobs.clone()),
            Recipe::default(),
            settings,
        );
        Self {
            cloud,
            ssh,
            blobs,
            launcher: Arc::new(launcher),
        }
    }
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capture_splits_redirects() {
        let (inner, out, err) =
            parse_capture("( docker logs kvnode ) > docker-logs-kvnode.out.txt 2> 'a b.err.txt'")
                .unwrap();
        assert_eq!(inner, "docker logs kvnode");
        assert_eq!(out, "docker-logs-kvnode.out.txt");
        assert_eq!(err, "a b.err.txt");
        assert!(parse_capture("docker ps").is_none());
    }

    #[tokio::test]
    async fn captured_output_can_be_read_back() {
        let ssh = MockSsh::new();
        ssh.fail_command("docker pull", 1, "manifest unknown");
        let mut session = ssh.connect("34.0.0.1").await.unwrap();

        let wrapped = session
            .exec("( docker pull kv:1 ) > a.out.txt 2> a.err.txt")
            .await
            .unwrap();
        assert_eq!(wrapped.exit_code, 1);

        let err = session.exec("cat -- a.err.txt").await.unwrap();
        assert_eq!(err.stdout, b"manifest unknown");
        let missing = session.exec("cat -- b.out.txt").await.unwrap();
        assert_eq!(missing.exit_code, 1);
    }

    #[tokio::test]
    async fn sessions_are_counted() {
        let ssh = MockSsh::new();
        let mut first = ssh.connect("h1").await.unwrap();
        let second = ssh.connect("h2").await.unwrap();
        assert_eq!(ssh.open_sessions(), 2);
        first.close().await.unwrap();
        drop(second);
        assert_eq!(ssh.open_sessions(), 0);
    }

    #[tokio::test]
    async fn cloud_assigns_distinct_addresses() {
        let cloud = MockCloud::new();
        let task_id = kvas_types::TaskId::new();
        for name in ["a", "b"] {
            cloud
                .create_instance(&InstanceRequest {
                    name: name.to_string(),
                    role: VmRole::Node,
                    task_id,
                })
                .await
                .unwrap();
        }
        let a = cloud.describe_instance("a").await.unwrap();
        let b = cloud.describe_instance("b").await.unwrap();
        assert_ne!(a.internal, b.internal);
        assert_eq!(cloud.live(), vec!["a".to_string(), "b".to_string()]);
    }
}
