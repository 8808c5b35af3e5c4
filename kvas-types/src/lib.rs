//! # kvas-types
//!
//! Shared types for the kvas load-test launcher.
//!
//! This crate provides the foundational types used by the launcher service and
//! its clients:
//! - [`TaskId`] - Task identity
//! - [`TaskState`], [`TaskSnapshot`], [`VmSummary`] - The outward task read model
//! - [`Topology`] - Cluster topology variants, parsed once at the API boundary
//! - [`LaunchRequest`] - Validated launch parameters
//! - [`LogArtifact`] - An archived log file
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod task;
mod topology;

pub use error::TypesError;
pub use ids::TaskId;
pub use task::{LaunchRequest, LogArtifact, TaskSnapshot, TaskState, VmRole, VmSummary};
pub use topology::Topology;
