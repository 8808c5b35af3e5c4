//! Task lifecycle and read-model types.
//!
//! These are the shapes the launcher hands to its API layer. They carry no
//! handles to live resources.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{TaskId, Topology, TypesError};

/// Lifecycle state of a task.
///
/// `Setup -> Running -> Finished`, with `Failure` reachable from either
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Machines are being provisioned and prepared.
    Setup,
    /// The cluster is bootstrapped and the workload is running.
    Running,
    /// Every step succeeded.
    Finished,
    /// Some step failed, or the task was cancelled or timed out.
    Failure,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failure)
    }

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Setup => "SETUP",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a machine plays inside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRole {
    /// Drives the load-test workload.
    Client,
    /// Runs one key-value store node.
    Node,
}

impl VmRole {
    /// Prefix used when naming cloud instances for this role.
    pub fn instance_prefix(&self) -> &'static str {
        match self {
            VmRole::Client => "kvclient",
            VmRole::Node => "kvnode",
        }
    }
}

impl fmt::Display for VmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmRole::Client => f.write_str("client"),
            VmRole::Node => f.write_str("node"),
        }
    }
}

/// Outward view of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    /// Role of the machine.
    pub role: VmRole,
    /// Cloud instance name.
    pub instance: String,
    /// Internal network address.
    pub address: String,
}

/// Outward view of a task, as served to API readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: TaskId,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Client machine, once acquired.
    pub client: Option<VmSummary>,
    /// Node machines in leader-first order; empty until all are acquired.
    pub nodes: Vec<VmSummary>,
    /// Instance name of the leader node, once its bootstrap was issued.
    pub leader: Option<String>,
}

impl TaskSnapshot {
    /// Snapshot of a freshly registered task.
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Setup,
            client: None,
            nodes: Vec::new(),
            leader: None,
        }
    }
}

/// One archived log file of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogArtifact {
    /// Storage key, `task_id/instance/file`.
    pub key: String,
    /// Location a reader can fetch the file from.
    pub url: String,
}

/// Validated parameters of a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Container image of the key-value node.
    pub image: String,
    /// Number of node machines, at least 1.
    pub node_count: u32,
    /// Cluster topology.
    pub topology: Topology,
}

impl LaunchRequest {
    /// Validate raw launch parameters.
    ///
    /// The topology string is parsed here, so unknown variants are rejected
    /// before anything is provisioned.
    pub fn parse(image: &str, node_count: u32, topology: &str) -> Result<Self, TypesError> {
        let request = Self {
            image: image.trim().to_string(),
            node_count,
            topology: topology.parse()?,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check the invariants of an already-built request.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.image.is_empty() {
            return Err(TypesError::EmptyImage);
        }
        if self.node_count == 0 {
            return Err(TypesError::InvalidNodeCount(self.node_count));
        }
        Ok(())
    }

    /// Reject requests for more than `max` nodes.
    pub fn check_node_limit(&self, max: u32) -> Result<(), TypesError> {
        if self.node_count > max {
            return Err(TypesError::TooManyNodes {
                requested: self.node_count,
                max,
            });
        }
        Ok(())
    }
}
