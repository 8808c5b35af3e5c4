//! Machine leases and their provider.
//!
//! A [`VmLease`] is one provisioned instance plus its lazily opened remote
//! channel. Leases are handed out by [`VmProvider::acquire`] and given back
//! with [`VmProvider::release`], which never blocks and is safe to call
//! any number of times.

pub mod gcloud;

use async_trait::async_trait;
use kvas_core::RetryPolicy;
use kvas_types::{TaskId, VmRole, VmSummary};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::task::TaskTracker;

use crate::error::ProvisionError;
use crate::ssh::SshSession;

pub use gcloud::GcloudBackend;

/// Parameters of one instance creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    /// Instance name, `<role prefix>-<uuid>`.
    pub name: String,
    /// Role the instance will play.
    pub role: VmRole,
    /// Owning task.
    pub task_id: TaskId,
}

/// Network addresses of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAddresses {
    /// Address inside the cluster network.
    pub internal: String,
    /// Address the launcher reaches the instance on.
    pub external: String,
}

/// Cloud instance lifecycle.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Create an instance and wait for the operation to complete.
    async fn create_instance(&self, request: &InstanceRequest) -> Result<(), ProvisionError>;

    /// Read the addresses of a created instance.
    async fn describe_instance(&self, name: &str) -> Result<InstanceAddresses, ProvisionError>;

    /// Delete an instance.
    async fn delete_instance(&self, name: &str) -> Result<(), ProvisionError>;
}

/// One provisioned machine.
pub struct VmLease {
    instance: String,
    role: VmRole,
    task_id: TaskId,
    addresses: InstanceAddresses,
    /// At most one live channel; holding the lock serialises commands.
    channel: Mutex<Option<Box<dyn SshSession>>>,
    released: AtomicBool,
}

impl std::fmt::Debug for VmLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLease")
            .field("instance", &self.instance)
            .field("role", &self.role)
            .field("task_id", &self.task_id)
            .field("addresses", &self.addresses)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl VmLease {
    /// Wrap an instance that already exists.
    pub fn new(
        instance: impl Into<String>,
        role: VmRole,
        task_id: TaskId,
        addresses: InstanceAddresses,
    ) -> Self {
        Self {
            instance: instance.into(),
            role,
            task_id,
            addresses,
            channel: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Cloud instance name.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Role of the machine.
    pub fn role(&self) -> VmRole {
        self.role
    }

    /// Owning task.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Address inside the cluster network.
    pub fn internal_address(&self) -> &str {
        &self.addresses.internal
    }

    /// Address used to reach the machine over ssh.
    pub fn external_address(&self) -> &str {
        &self.addresses.external
    }

    /// Whether [`VmProvider::release`] has been called on this lease.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Outward view of the lease.
    pub fn summary(&self) -> VmSummary {
        VmSummary {
            role: self.role,
            instance: self.instance.clone(),
            address: self.addresses.internal.clone(),
        }
    }

    pub(crate) fn channel(&self) -> &Mutex<Option<Box<dyn SshSession>>> {
        &self.channel
    }

    /// Close the channel if one is open. Waits for any running command.
    pub async fn close_channel(&self) {
        let session = self.channel.lock().await.take();
        if let Some(mut session) = session {
            if let Err(e) = session.close().await {
                tracing::warn!(instance = %self.instance, error = %e, "closing channel failed");
            }
        }
    }

    /// Returns true for the first caller only.
    fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

/// Acquires and releases leases through a [`CloudBackend`].
///
/// Provisioning, releases and orphan deletions run as background jobs on
/// the provider's tracker. They outlive the callers that started them;
/// [`VmProvider::shutdown`] waits for all of them.
#[derive(Clone)]
pub struct VmProvider {
    backend: Arc<dyn CloudBackend>,
    retry: RetryPolicy,
    acquire_timeout: Duration,
    jobs: TaskTracker,
}

impl std::fmt::Debug for VmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmProvider")
            .field("retry", &self.retry)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("pending_jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

type Provisioned = Result<Arc<VmLease>, ProvisionError>;

/// Caller's end of an acquisition.
///
/// If the caller goes away before taking the lease (cancelled task, task
/// deadline), dropping this hands whatever arrived back to the provider;
/// a lease that arrives later is released by the provisioning job.
struct PendingLease {
    rx: oneshot::Receiver<Provisioned>,
    provider: VmProvider,
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(lease)) = self.rx.try_recv() {
            tracing::info!(instance = %lease.instance(), "acquisition abandoned, releasing");
            self.provider.release(&lease);
        }
    }
}

impl VmProvider {
    /// Create a provider.
    ///
    /// `retry` governs address lookups after creation; `acquire_timeout`
    /// bounds a whole acquisition.
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        retry: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            retry,
            acquire_timeout,
            jobs: TaskTracker::new(),
        }
    }

    /// Provision a machine for `task_id`.
    ///
    /// Dropping the returned future does not abandon the instance: the
    /// provisioning job runs to completion and releases what it created.
    ///
    /// # Errors
    ///
    /// Fails if creation fails, if the addresses cannot be read within the
    /// retry budget, or if the whole acquisition exceeds its deadline. An
    /// instance that may exist after a failure is deleted in the background.
    pub async fn acquire(
        &self,
        role: VmRole,
        task_id: TaskId,
    ) -> Result<Arc<VmLease>, ProvisionError> {
        let request = InstanceRequest {
            name: format!("{}-{}", role.instance_prefix(), uuid::Uuid::new_v4()),
            role,
            task_id,
        };
        let instance = request.name.clone();

        let (tx, rx) = oneshot::channel();
        self.jobs.spawn(self.clone().provision_job(request, tx));
        let mut pending = PendingLease {
            rx,
            provider: self.clone(),
        };

        match (&mut pending.rx).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Backend {
                operation: "create",
                instance,
                reason: "provisioning job aborted".to_string(),
            }),
        }
    }

    async fn provision_job(self, request: InstanceRequest, tx: oneshot::Sender<Provisioned>) {
        let result = match tokio::time::timeout(self.acquire_timeout, self.provision(&request)).await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    task_id = %request.task_id,
                    instance = %request.name,
                    "acquisition timed out"
                );
                self.spawn_delete(request.name.clone());
                Err(ProvisionError::Timeout {
                    role: request.role,
                    instance: request.name.clone(),
                    secs: self.acquire_timeout.as_secs(),
                })
            }
        };

        if let Err(Ok(lease)) = tx.send(result) {
            tracing::info!(
                task_id = %request.task_id,
                instance = %lease.instance(),
                "instance created after its task gave up, releasing"
            );
            self.release(&lease);
        }
    }

    async fn provision(&self, request: &InstanceRequest) -> Result<Arc<VmLease>, ProvisionError> {
        self.backend.create_instance(request).await?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=max_attempts {
            match self.backend.describe_instance(&request.name).await {
                Ok(addresses) => {
                    tracing::info!(
                        task_id = %request.task_id,
                        instance = %request.name,
                        address = %addresses.internal,
                        "instance created"
                    );
                    return Ok(Arc::new(VmLease::new(
                        request.name.clone(),
                        request.role,
                        request.task_id,
                        addresses,
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        instance = %request.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "could not get instance information"
                    );
                    last = e.to_string();
                    if self.retry.should_retry(attempt) {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        self.spawn_delete(request.name.clone());
        Err(ProvisionError::Exhausted {
            instance: request.name.clone(),
            attempts: max_attempts,
            last,
        })
    }

    /// Give a lease back.
    ///
    /// Closes the channel and deletes the instance in the background. Only
    /// the first call for a lease does anything; failures are logged.
    pub fn release(&self, lease: &Arc<VmLease>) {
        if !lease.mark_released() {
            tracing::debug!(instance = %lease.instance(), "lease already released");
            return;
        }

        let backend = Arc::clone(&self.backend);
        let lease = Arc::clone(lease);
        self.jobs.spawn(async move {
            lease.close_channel().await;
            match backend.delete_instance(lease.instance()).await {
                Ok(()) => tracing::info!(
                    task_id = %lease.task_id(),
                    instance = %lease.instance(),
                    "instance shut down"
                ),
                Err(e) => tracing::error!(
                    task_id = %lease.task_id(),
                    instance = %lease.instance(),
                    error = %e,
                    "error while shutting down instance"
                ),
            }
        });
    }

    /// Number of provisioning, release and deletion jobs still running.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Wait for every background job, including jobs they start.
    ///
    /// Acquisitions and releases requested after this still run and are
    /// waited for if they start before the last job ends.
    pub async fn shutdown(&self) {
        self.jobs.close();
        self.jobs.wait().await;
    }

    fn spawn_delete(&self, name: String) {
        let backend = Arc::clone(&self.backend);
        self.jobs.spawn(async move {
            match backend.delete_instance(&name).await {
                Ok(()) => tracing::info!(instance = %name, "orphan instance deleted"),
                Err(e) => tracing::error!(instance = %name, error = %e, "orphan instance not deleted"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{eventually, MockCloud};

    fn provider(cloud: &MockCloud) -> VmProvider {
        VmProvider::new(
            Arc::new(cloud.clone()),
            RetryPolicy::immediate(3),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn acquire_names_by_role() {
        let cloud = MockCloud::new();
        let task_id = TaskId::new();
        let lease = provider(&cloud).acquire(VmRole::Client, task_id).await.unwrap();

        assert!(lease.instance().starts_with("kvclient-"));
        assert_eq!(lease.task_id(), task_id);
        assert_eq!(lease.summary().address, lease.internal_address());
        assert_eq!(cloud.created(), vec![lease.instance().to_string()]);
    }

    #[tokio::test]
    async fn describe_is_retried() {
        let cloud = MockCloud::new();
        cloud.fail_describe(2);
        let lease = provider(&cloud).acquire(VmRole::Node, TaskId::new()).await;
        assert!(lease.is_ok());
        assert_eq!(cloud.describe_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_lookup_deletes_orphan() {
        let cloud = MockCloud::new();
        cloud.fail_describe(3);
        let err = provider(&cloud)
            .acquire(VmRole::Node, TaskId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Exhausted { attempts: 3, .. }));
        let created = cloud.created();
        assert!(eventually(|| cloud.deleted() == created).await);
    }

    #[tokio::test]
    async fn failed_create_is_reported() {
        let cloud = MockCloud::new();
        cloud.fail_create(VmRole::Node, 0);
        let err = provider(&cloud)
            .acquire(VmRole::Node, TaskId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Backend {
                operation: "create",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_create_times_out() {
        let cloud = MockCloud::new();
        cloud.set_create_delay(Duration::from_secs(60));
        let provider = VmProvider::new(
            Arc::new(cloud.clone()),
            RetryPolicy::immediate(3),
            Duration::from_millis(20),
        );
        let err = provider
            .acquire(VmRole::Node, TaskId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { role: VmRole::Node, .. }));
        assert!(eventually(|| cloud.live().is_empty()).await);
    }

    #[tokio::test]
    async fn dropped_acquisition_releases_its_instance() {
        let cloud = MockCloud::new();
        cloud.set_create_delay(Duration::from_millis(100));
        let provider = provider(&cloud);

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            provider.acquire(VmRole::Node, TaskId::new()),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(cloud.live().len(), 1);

        provider.shutdown().await;
        assert!(cloud.live().is_empty());
        assert_eq!(cloud.deleted(), cloud.created());
    }

    #[tokio::test]
    async fn shutdown_waits_for_releases() {
        let cloud = MockCloud::new();
        let provider = provider(&cloud);
        let a = provider.acquire(VmRole::Node, TaskId::new()).await.unwrap();
        let b = provider.acquire(VmRole::Client, TaskId::new()).await.unwrap();

        provider.release(&a);
        provider.release(&b);
        provider.shutdown().await;

        assert_eq!(provider.pending_jobs(), 0);
        assert_eq!(cloud.deleted().len(), 2);
    }

    #[tokio::test]
    async fn release_twice_deletes_once() {
        let cloud = MockCloud::new();
        let provider = provider(&cloud);
        let lease = provider.acquire(VmRole::Node, TaskId::new()).await.unwrap();

        provider.release(&lease);
        provider.release(&lease);

        assert!(lease.is_released());
        assert!(eventually(|| cloud.deleted().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cloud.deleted(), vec![lease.instance().to_string()]);
    }

    #[tokio::test]
    async fn release_failure_is_swallowed() {
        let cloud = MockCloud::new();
        cloud.fail_deletes();
        let provider = provider(&cloud);
        let lease = provider.acquire(VmRole::Client, TaskId::new()).await.unwrap();
        provider.release(&lease);
        assert!(eventually(|| cloud.delete_calls() == 1).await);
        assert!(cloud.deleted().is_empty());
    }
}
