//! Cluster topology variants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// How the key-value nodes of a task are wired together.
///
/// Parsed once at the API boundary; everything downstream matches on the
/// variant instead of re-reading strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// One leader accepts writes and streams them to followers.
    Replication,
    /// The leader routes keys to shards by hash; followers own one shard each.
    #[serde(alias = "sharding")]
    NaiveSharding,
}

impl Topology {
    /// Canonical name of the variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Replication => "replication",
            Topology::NaiveSharding => "naive-sharding",
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::Replication
    }
}

impl FromStr for Topology {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replication" => Ok(Topology::Replication),
            "sharding" | "naive-sharding" | "naive_sharding" => Ok(Topology::NaiveSharding),
            _ => Err(TypesError::UnknownTopology(s.to_string())),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
