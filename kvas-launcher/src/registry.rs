//! Task registry.
//!
//! The single source of truth for task status. Reads are open to anyone;
//! writes are crate-private and made only by the task's own run.

use dashmap::DashMap;
use kvas_core::transition;
use kvas_types::{TaskId, TaskSnapshot, TaskState};
use std::sync::Arc;

use crate::error::RegistryError;
use crate::vm::VmLease;

#[derive(Debug)]
struct TaskRecord {
    state: TaskState,
    client: Option<Arc<VmLease>>,
    /// `None` until every node is acquired; then set once.
    nodes: Option<Vec<Arc<VmLease>>>,
    leader: Option<Arc<VmLease>>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            state: TaskState::Setup,
            client: None,
            nodes: None,
            leader: None,
        }
    }

    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            state: self.state,
            client: self.client.as_ref().map(|lease| lease.summary()),
            nodes: self
                .nodes
                .iter()
                .flatten()
                .map(|lease| lease.summary())
                .collect(),
            leader: self
                .leader
                .as_ref()
                .map(|lease| lease.instance().to_string()),
        }
    }
}

/// Concurrent map of task id to task record.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view of a task.
    pub fn get(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(id).map(|record| record.snapshot(*id))
    }

    /// Current state of a task.
    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|record| record.state)
    }

    /// Views of every task, in no particular order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect()
    }

    /// Number of tasks in `state`.
    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.value().state == state)
            .count()
    }

    /// Number of tasks ever launched.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if no task was launched yet.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Internal address of the leader node, once recorded.
    pub fn leader_address(&self, id: &TaskId) -> Option<String> {
        self.tasks.get(id).and_then(|record| {
            record
                .leader
                .as_ref()
                .map(|lease| lease.internal_address().to_string())
        })
    }

    pub(crate) fn register(&self, id: TaskId) -> TaskSnapshot {
        let record = TaskRecord::new();
        let snapshot = record.snapshot(id);
        self.tasks.insert(id, record);
        snapshot
    }

    pub(crate) fn transition(&self, id: &TaskId, to: TaskState) -> Result<(), RegistryError> {
        let mut record = self.tasks.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.state = transition(record.state, to)?;
        tracing::info!(task_id = %id, state = %to, "task state changed");
        Ok(())
    }

    pub(crate) fn set_client(&self, id: &TaskId, lease: Arc<VmLease>) -> Result<(), RegistryError> {
        let mut record = self.tasks.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.client = Some(lease);
        Ok(())
    }

    /// Record the complete node list, leader first.
    pub(crate) fn set_nodes(
        &self,
        id: &TaskId,
        nodes: Vec<Arc<VmLease>>,
    ) -> Result<(), RegistryError> {
        let mut record = self.tasks.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        if record.nodes.is_some() {
            return Err(RegistryError::NodesAlreadySet(*id));
        }
        record.nodes = Some(nodes);
        Ok(())
    }

    pub(crate) fn set_leader(&self, id: &TaskId, lease: Arc<VmLease>) -> Result<(), RegistryError> {
        let mut record = self.tasks.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.leader = Some(lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InstanceAddresses;
    use kvas_types::VmRole;

    fn lease(id: TaskId, name: &str, n: u8) -> Arc<VmLease> {
        Arc::new(VmLease::new(
            name,
            VmRole::Node,
            id,
            InstanceAddresses {
                internal: format!("10.0.0.{}", n),
                external: format!("34.0.0.{}", n),
            },
        ))
    }

    #[test]
    fn registered_task_starts_in_setup() {
        let registry = TaskRegistry::new();
        let id = TaskId::new();
        let snapshot = registry.register(id);

        assert_eq!(snapshot, TaskSnapshot::new(id));
        assert_eq!(registry.state(&id), Some(TaskState::Setup));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&TaskId::new()).is_none());
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let registry = TaskRegistry::new();
        let id = TaskId::new();
        registry.register(id);

        assert!(registry.transition(&id, TaskState::Finished).is_err());
        registry.transition(&id, TaskState::Running).unwrap();
        registry.transition(&id, TaskState::Finished).unwrap();
        assert!(matches!(
            registry.transition(&id, TaskState::Failure),
            Err(RegistryError::Transition(_))
        ));
        assert_eq!(registry.state(&id), Some(TaskState::Finished));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let registry = TaskRegistry::new();
        let id = TaskId::new();
        assert!(matches!(
            registry.transition(&id, TaskState::Running),
            Err(RegistryError::NotFound(missing)) if missing == id
        ));
    }

    #[test]
    fn nodes_are_written_once() {
        let registry = TaskRegistry::new();
        let id = TaskId::new();
        registry.register(id);

        registry
            .set_nodes(&id, vec![lease(id, "kvnode-a", 1), lease(id, "kvnode-b", 2)])
            .unwrap();
        assert!(matches!(
            registry.set_nodes(&id, vec![lease(id, "kvnode-c", 3)]),
            Err(RegistryError::NodesAlreadySet(_))
        ));

        let snapshot = registry.get(&id).unwrap();
        let names: Vec<_> = snapshot.nodes.iter().map(|n| n.instance.as_str()).collect();
        assert_eq!(names, ["kvnode-a", "kvnode-b"]);
    }

    #[test]
    fn leader_and_client_show_in_snapshot() {
        let registry = TaskRegistry::new();
        let id = TaskId::new();
        registry.register(id);
        let leader = lease(id, "kvnode-a", 7);

        registry.set_client(&id, lease(id, "kvclient-x", 9)).unwrap();
        registry.set_leader(&id, leader).unwrap();

        let snapshot = registry.get(&id).unwrap();
        assert_eq!(snapshot.leader.as_deref(), Some("kvnode-a"));
        assert_eq!(snapshot.client.unwrap().instance, "kvclient-x");
        assert_eq!(registry.leader_address(&id).as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn counts_by_state() {
        let registry = TaskRegistry::new();
        let a = TaskId::new();
        let b = TaskId::new();
        registry.register(a);
        registry.register(b);
        registry.transition(&a, TaskState::Failure).unwrap();

        assert_eq!(registry.count_in(TaskState::Setup), 1);
        assert_eq!(registry.count_in(TaskState::Failure), 1);
        assert_eq!(registry.list().len(), 2);
    }
}
