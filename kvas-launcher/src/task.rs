//! Task orchestration.
//!
//! [`Launcher::launch_task`] registers a task in SETUP and spawns its run on
//! the tokio worker pool. The run:
//!
//! 1. acquires the client and all nodes concurrently (join-all, so one
//!    failed acquisition never cancels its siblings),
//! 2. records the nodes (leader first) and runs the setup sequences,
//! 3. moves to RUNNING and bootstraps leader and followers in parallel,
//! 4. runs the load test on the client against the leader,
//! 5. archives every node's logs,
//!
//! and then releases every machine it acquired, whatever happened. Any
//! error, cancellation or deadline ends the task in FAILURE.

use dashmap::DashMap;
use futures_util::future::join_all;
use kvas_core::{Recipe, RetryPolicy, TopologyStrategy};
use kvas_types::{
    LaunchRequest, LogArtifact, TaskId, TaskSnapshot, TaskState, TypesError, VmRole,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::blob::{self, BlobStore};
use crate::config::{Config, TasksConfig};
use crate::error::{ExecError, LauncherError, ProvisionError, RegistryError, TaskError};
use crate::executor::RemoteExecutor;
use crate::registry::TaskRegistry;
use crate::ssh::OpensshConnector;
use crate::vm::{GcloudBackend, VmLease, VmProvider};

/// Limits applied to every task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    /// Deadline of one run, measured from admission.
    pub timeout: Duration,
    /// Runs admitted at once; others wait in SETUP.
    pub max_concurrent: usize,
    /// Largest node count a launch may request.
    pub max_nodes: u32,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self::from(&TasksConfig::default())
    }
}

impl From<&TasksConfig> for TaskSettings {
    fn from(config: &TasksConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_concurrent: config.max_concurrent.max(1),
            max_nodes: config.max_nodes.max(1),
        }
    }
}

/// Handle to a launched task.
#[derive(Debug)]
pub struct TaskHandle {
    /// Snapshot taken at registration (state SETUP).
    pub snapshot: TaskSnapshot,
    cancel: CancellationToken,
    join: JoinHandle<Result<(), TaskError>>,
}

impl TaskHandle {
    /// Task identifier.
    pub fn id(&self) -> TaskId {
        self.snapshot.id
    }

    /// Ask the run to stop. It releases its machines and ends in FAILURE.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to end and return its outcome.
    pub async fn wait(self) -> Result<(), TaskError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Panicked(e.to_string())),
        }
    }
}

/// Launches task runs and answers questions about them.
pub struct Launcher {
    registry: Arc<TaskRegistry>,
    provider: Arc<VmProvider>,
    executor: Arc<RemoteExecutor>,
    blobs: Arc<dyn BlobStore>,
    recipe: Arc<Recipe>,
    settings: TaskSettings,
    permits: Arc<Semaphore>,
    controls: Arc<DashMap<TaskId, CancellationToken>>,
    runs: TaskTracker,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("settings", &self.settings)
            .field("tasks", &self.registry.len())
            .field("active_runs", &self.controls.len())
            .finish_non_exhaustive()
    }
}

impl Launcher {
    /// Assemble a launcher from its parts.
    pub fn new(
        registry: Arc<TaskRegistry>,
        provider: VmProvider,
        executor: RemoteExecutor,
        blobs: Arc<dyn BlobStore>,
        recipe: Recipe,
        settings: TaskSettings,
    ) -> Self {
        Self {
            registry,
            provider: Arc::new(provider),
            executor: Arc::new(executor),
            blobs,
            recipe: Arc::new(recipe),
            permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings,
            controls: Arc::new(DashMap::new()),
            runs: TaskTracker::new(),
        }
    }

    /// Build the production launcher: gcloud instances, OpenSSH sessions,
    /// and the configured log archive.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate, the SSH public key
    /// cannot be read, or the log archive cannot be opened.
    pub fn from_config(config: &Config) -> Result<Self, LauncherError> {
        config.validate()?;
        let login = config.ssh.login.clone().unwrap_or_default();
        let key_file = config.ssh.key_file.clone().unwrap_or_default();

        let mut public_key_path = key_file.clone().into_os_string();
        public_key_path.push(".pub");
        let public_key_path = PathBuf::from(public_key_path);
        let public_key = std::fs::read_to_string(&public_key_path).map_err(|source| {
            LauncherError::PublicKey {
                path: public_key_path.clone(),
                source,
            }
        })?;

        let retry = RetryPolicy {
            max_attempts: config.cloud.describe_attempts,
            base_delay: Duration::from_millis(config.cloud.retry_base_delay_ms),
            max_delay: Duration::from_secs(30),
        };
        let provider = VmProvider::new(
            Arc::new(GcloudBackend::new(config.cloud.clone(), &login, &public_key)),
            retry,
            config.cloud.acquire_timeout(),
        );

        let connector = OpensshConnector::new(
            login,
            key_file,
            config.ssh.port,
            Duration::from_secs(config.ssh.connect_timeout_secs),
            config.ssh.control_dir.clone(),
        );
        let blobs = blob::from_config(&config.storage)?;
        let executor = RemoteExecutor::new(
            Arc::new(connector),
            Arc::clone(&blobs),
            config.ssh.connect_attempts,
            Duration::from_millis(config.ssh.retry_delay_ms),
        );

        Ok(Self::new(
            Arc::new(TaskRegistry::new()),
            provider,
            executor,
            blobs,
            config.recipe.clone(),
            TaskSettings::from(&config.tasks),
        ))
    }

    /// The task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Limits applied to task runs.
    pub fn settings(&self) -> TaskSettings {
        self.settings
    }

    /// Number of runs that have not ended yet.
    pub fn active_runs(&self) -> usize {
        self.controls.len()
    }

    /// Register a task and start its run in the background.
    ///
    /// Returns as soon as the task is registered; the snapshot in the
    /// handle is always in SETUP. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidRequest`] for an empty image or a node
    /// count of zero or above the limit, and [`TaskError::ShuttingDown`]
    /// once [`Launcher::shutdown`] has started. Nothing is registered in
    /// either case.
    pub fn launch_task(&self, request: LaunchRequest) -> Result<TaskHandle, TaskError> {
        request.validate()?;
        request.check_node_limit(self.settings.max_nodes)?;
        if self.runs.is_closed() {
            return Err(TaskError::ShuttingDown);
        }

        let id = TaskId::new();
        let snapshot = self.registry.register(id);
        let cancel = CancellationToken::new();
        self.controls.insert(id, cancel.clone());

        tracing::info!(
            task_id = %id,
            image = %request.image,
            node_count = request.node_count,
            topology = %request.topology,
            "launching task"
        );

        let run = TaskRun {
            id,
            request,
            registry: Arc::clone(&self.registry),
            provider: Arc::clone(&self.provider),
            executor: Arc::clone(&self.executor),
            recipe: Arc::clone(&self.recipe),
            timeout: self.settings.timeout,
            ledger: DashMap::new(),
        };
        let join = self.runs.spawn(run.drive(
            cancel.clone(),
            Arc::clone(&self.permits),
            Arc::clone(&self.controls),
        ));

        Ok(TaskHandle {
            snapshot,
            cancel,
            join,
        })
    }

    /// Current view of a task.
    pub fn get_task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.registry.get(id)
    }

    /// Cancel a running task. Returns false if the task is unknown or its
    /// run already ended.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        match self.controls.get(id) {
            Some(token) => {
                tracing::info!(task_id = %id, "cancelling task");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Archived log files of a task.
    ///
    /// # Errors
    ///
    /// Fails if the task is unknown or the archive cannot be listed.
    pub async fn list_logs(&self, id: &TaskId) -> Result<Vec<LogArtifact>, TaskError> {
        if self.registry.get(id).is_none() {
            return Err(RegistryError::NotFound(*id).into());
        }
        let keys = self.blobs.list(&format!("{}/", id)).await?;
        let urls = join_all(keys.iter().map(|key| self.blobs.url_for(key))).await;
        keys.into_iter()
            .zip(urls)
            .map(|(key, url)| -> Result<LogArtifact, TaskError> {
                Ok(LogArtifact { url: url?, key })
            })
            .collect()
    }

    /// Stop accepting tasks, cancel every run, and wait until the runs and
    /// all machine releases they started have finished.
    pub async fn shutdown(&self) {
        self.runs.close();
        let active: Vec<TaskId> = self.controls.iter().map(|entry| *entry.key()).collect();
        tracing::info!(active = active.len(), "cancelling active tasks");
        for id in &active {
            self.cancel_task(id);
        }
        self.runs.wait().await;

        tracing::info!(jobs = self.provider.pending_jobs(), "waiting for machine cleanup");
        self.provider.shutdown().await;
    }
}

/// One task's background run.
struct TaskRun {
    id: TaskId,
    request: LaunchRequest,
    registry: Arc<TaskRegistry>,
    provider: Arc<VmProvider>,
    executor: Arc<RemoteExecutor>,
    recipe: Arc<Recipe>,
    timeout: Duration,
    /// Every lease acquired so far, by instance name.
    ledger: DashMap<String, Arc<VmLease>>,
}

fn first_error(results: Vec<Result<(), ExecError>>) -> Result<(), ExecError> {
    results.into_iter().collect()
}

impl TaskRun {
    async fn drive(
        self,
        cancel: CancellationToken,
        permits: Arc<Semaphore>,
        controls: Arc<DashMap<TaskId, CancellationToken>>,
    ) -> Result<(), TaskError> {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.admit_and_execute(&permits) => result,
        };

        self.release_all();
        controls.remove(&self.id);

        match result {
            Ok(()) => {
                self.registry.transition(&self.id, TaskState::Finished)?;
                tracing::info!(task_id = %self.id, "task finished");
                Ok(())
            }
            Err(e) => {
                tracing::error!(task_id = %self.id, error = %e, "task failed");
                if let Err(transition) = self.registry.transition(&self.id, TaskState::Failure) {
                    tracing::warn!(task_id = %self.id, error = %transition, "could not record failure");
                }
                Err(e)
            }
        }
    }

    async fn admit_and_execute(&self, permits: &Semaphore) -> Result<(), TaskError> {
        let _permit = permits.acquire().await.map_err(|_| TaskError::Cancelled)?;
        tracing::debug!(task_id = %self.id, "task admitted");

        match tokio::time::timeout(self.timeout, self.execute()).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::TimedOut {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn execute(&self) -> Result<(), TaskError> {
        let (client, nodes) = tokio::join!(self.acquire_client(), self.acquire_nodes());
        let client = client?;
        let nodes = nodes?;
        let leader = nodes
            .first()
            .cloned()
            .ok_or(TaskError::InvalidRequest(TypesError::InvalidNodeCount(0)))?;
        self.registry.set_nodes(&self.id, nodes.clone())?;
        tracing::info!(
            task_id = %self.id,
            leader = %leader.instance(),
            nodes = nodes.len(),
            "machines acquired"
        );

        self.setup(&client, &nodes).await?;

        self.registry.transition(&self.id, TaskState::Running)?;
        self.bootstrap(&leader, &nodes).await?;

        let load_test = self.recipe.load_test(leader.internal_address());
        self.executor
            .run_sequence(&client, std::slice::from_ref(&load_test), true)
            .await?;

        self.collect_logs(&nodes).await
    }

    async fn acquire(&self, role: VmRole) -> Result<Arc<VmLease>, ProvisionError> {
        let lease = self.provider.acquire(role, self.id).await?;
        self.ledger
            .insert(lease.instance().to_string(), Arc::clone(&lease));
        Ok(lease)
    }

    async fn acquire_client(&self) -> Result<Arc<VmLease>, TaskError> {
        let client = self.acquire(VmRole::Client).await?;
        self.registry.set_client(&self.id, Arc::clone(&client))?;
        Ok(client)
    }

    async fn acquire_nodes(&self) -> Result<Vec<Arc<VmLease>>, TaskError> {
        let acquisitions = (0..self.request.node_count).map(|_| self.acquire(VmRole::Node));
        let nodes = join_all(acquisitions)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    async fn setup(&self, client: &Arc<VmLease>, nodes: &[Arc<VmLease>]) -> Result<(), TaskError> {
        let node_steps = self.recipe.node_setup(&self.request.image);
        let client_steps = self.recipe.client_setup();

        let (node_results, client_result) = tokio::join!(
            join_all(
                nodes
                    .iter()
                    .map(|node| self.executor.run_sequence(node, &node_steps, false))
            ),
            self.executor.run_sequence(client, &client_steps, false),
        );

        if let Err(e) = client_result {
            self.provider.release(client);
            return Err(e.into());
        }
        first_error(node_results)?;
        Ok(())
    }

    async fn bootstrap(&self, leader: &Arc<VmLease>, nodes: &[Arc<VmLease>]) -> Result<(), TaskError> {
        let strategy = TopologyStrategy::new(
            self.request.topology,
            self.request.image.clone(),
            self.recipe.kv_port,
        );
        let leader_address = leader.internal_address();
        self.registry.set_leader(&self.id, Arc::clone(leader))?;

        let commands: Vec<(&Arc<VmLease>, String)> = nodes
            .iter()
            .map(|node| {
                let command = if Arc::ptr_eq(node, leader) {
                    strategy.leader_command(leader_address)
                } else {
                    strategy.follower_command(leader_address, node.internal_address())
                };
                (node, command)
            })
            .collect();

        let results = join_all(commands.iter().map(|(node, command)| {
            self.executor
                .run_sequence(node, std::slice::from_ref(command), true)
        }))
        .await;
        first_error(results)?;
        Ok(())
    }

    async fn collect_logs(&self, nodes: &[Arc<VmLease>]) -> Result<(), TaskError> {
        let logs = [self.recipe.node_logs()];
        let results = join_all(
            nodes
                .iter()
                .map(|node| self.executor.run_sequence(node, &logs, true)),
        )
        .await;
        first_error(results)?;
        Ok(())
    }

    fn release_all(&self) {
        for entry in self.ledger.iter() {
            self.provider.release(entry.value());
        }
        tracing::debug!(task_id = %self.id, leases = self.ledger.len(), "leases released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRig;
    use kvas_types::Topology;

    fn request(node_count: u32) -> LaunchRequest {
        LaunchRequest {
            image: "kv:1".into(),
            node_count,
            topology: Topology::Replication,
        }
    }

    #[test]
    fn settings_follow_config() {
        let settings = TaskSettings::from(&TasksConfig {
            timeout_secs: 10,
            max_concurrent: 0,
            max_nodes: 6,
        });
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.max_concurrent, 1);
        assert_eq!(settings.max_nodes, 6);
    }

    #[tokio::test]
    async fn invalid_request_is_not_registered() {
        let rig = MockRig::new();
        let err = rig.launcher.launch_task(request(0)).unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidRequest(TypesError::InvalidNodeCount(0))
        ));
        assert!(rig.launcher.registry().is_empty());
    }

    #[tokio::test]
    async fn node_count_above_limit_is_rejected() {
        let rig = MockRig::with_settings(TaskSettings {
            max_nodes: 2,
            ..TaskSettings::default()
        });
        let err = rig.launcher.launch_task(request(3)).unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidRequest(TypesError::TooManyNodes { requested: 3, max: 2 })
        ));
        assert!(rig.launcher.registry().is_empty());
        assert!(rig.cloud.created().is_empty());
    }

    #[tokio::test]
    async fn no_launches_after_shutdown() {
        let rig = MockRig::new();
        rig.launcher.shutdown().await;
        assert!(matches!(
            rig.launcher.launch_task(request(1)),
            Err(TaskError::ShuttingDown)
        ));
        assert!(rig.launcher.registry().is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_false() {
        let rig = MockRig::new();
        assert!(!rig.launcher.cancel_task(&TaskId::new()));
    }

    #[tokio::test]
    async fn finished_run_is_no_longer_cancellable() {
        let rig = MockRig::new();
        let handle = rig.launcher.launch_task(request(1)).unwrap();
        let id = handle.id();
        handle.wait().await.unwrap();

        assert_eq!(rig.launcher.active_runs(), 0);
        assert!(!rig.launcher.cancel_task(&id));
    }

    #[tokio::test]
    async fn list_logs_of_unknown_task_fails() {
        let rig = MockRig::new();
        assert!(matches!(
            rig.launcher.list_logs(&TaskId::new()).await,
            Err(TaskError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn list_logs_returns_urls() {
        let rig = MockRig::new();
        let handle = rig.launcher.launch_task(request(1)).unwrap();
        let id = handle.id();
        handle.wait().await.unwrap();

        let logs = rig.launcher.list_logs(&id).await.unwrap();
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|log| log.key.starts_with(&id.to_string())));
        assert!(logs.iter().all(|log| log.url == format!("memory:///{}", log.key)));
    }
}
