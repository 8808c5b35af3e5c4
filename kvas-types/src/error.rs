//! Error types for kvas-types.

use thiserror::Error;

/// Errors raised while parsing or validating launcher input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// Task identifier is not a valid UUID.
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    /// Topology name does not match any known variant.
    #[error("unknown topology: {0}")]
    UnknownTopology(String),

    /// A cluster needs at least one node.
    #[error("node count must be at least 1, got {0}")]
    InvalidNodeCount(u32),

    /// More nodes than the launcher allows per task.
    #[error("node count {requested} exceeds the limit of {max}")]
    TooManyNodes {
        /// Requested node count.
        requested: u32,
        /// Configured maximum.
        max: u32,
    },

    /// Image reference is empty.
    #[error("image must not be empty")]
    EmptyImage,
}
