//! # kvas-core
//!
//! Pure logic for the kvas launcher (no I/O, instant tests).
//!
//! This crate holds the rules the orchestrator follows without performing
//! any network, process or disk I/O:
//! - [`state`] - which task state transitions are legal
//! - [`topology`] - leader/follower bootstrap commands per topology
//! - [`capture`] - how captured command output is named and keyed
//! - [`retry`] - bounded retry schedules
//! - [`recipe`] - the command sequences a task runs on its machines
//! - [`shell`] - quoting for values spliced into remote commands
//!
//! The launcher crate interprets these decisions and performs the I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod recipe;
pub mod retry;
pub mod shell;
pub mod state;
pub mod topology;

pub use capture::{blob_key, sanitize_command, stderr_excerpt, CapturePlan};
pub use recipe::Recipe;
pub use retry::RetryPolicy;
pub use state::{transition, TransitionError};
pub use topology::TopologyStrategy;
