//! Leader/follower bootstrap commands per cluster topology.
//!
//! A [`TopologyStrategy`] is chosen once per task. It is stateless: the same
//! addresses always produce the same commands.

use kvas_types::Topology;

use crate::shell::quote;

/// Name of the container every key-value node runs in.
pub const NODE_CONTAINER: &str = "kvnode";

/// Builds the bootstrap commands for one task's cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyStrategy {
    topology: Topology,
    image: String,
    port: u16,
}

impl TopologyStrategy {
    /// Create a strategy for `topology` running `image`, serving on `port`.
    pub fn new(topology: Topology, image: impl Into<String>, port: u16) -> Self {
        Self {
            topology,
            image: image.into(),
            port,
        }
    }

    /// The topology this strategy was built for.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Port every node listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Command that starts the leader node.
    pub fn leader_command(&self, leader_address: &str) -> String {
        let role = match self.topology {
            Topology::Replication => "--replication leader".to_string(),
            Topology::NaiveSharding => "--sharding router".to_string(),
        };
        format!(
            "{} {} --advertise {}",
            self.run_prefix(),
            role,
            quote(&self.endpoint(leader_address))
        )
    }

    /// Command that starts a follower node and points it at the leader.
    pub fn follower_command(&self, leader_address: &str, self_address: &str) -> String {
        let role = match self.topology {
            Topology::Replication => {
                format!("--replication follower --leader {}", quote(&self.endpoint(leader_address)))
            }
            Topology::NaiveSharding => {
                format!("--sharding shard --router {}", quote(&self.endpoint(leader_address)))
            }
        };
        format!(
            "{} {} --advertise {}",
            self.run_prefix(),
            role,
            quote(&self.endpoint(self_address))
        )
    }

    fn run_prefix(&self) -> String {
        format!(
            "docker run -d --name {} --network host {} --port {}",
            NODE_CONTAINER,
            quote(&self.image),
            self.port
        )
    }

    fn endpoint(&self, address: &str) -> String {
        format!("{}:{}", address, self.port)
    }
}
