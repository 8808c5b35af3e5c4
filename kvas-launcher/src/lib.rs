//! # kvas-launcher
//!
//! Task orchestrator for kvas load tests.
//!
//! A task provisions one client VM and N node VMs, installs the key-value
//! store on the nodes, bootstraps them into a cluster, drives a load test
//! from the client, archives every captured log and tears the machines
//! down again, whatever the outcome.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum) ──► Launcher ──► TaskRegistry (DashMap, read model)
//!                      │
//!                      ├──► VmProvider ──► CloudBackend (gcloud)
//!                      │
//!                      └──► RemoteExecutor ──► SshConnector (openssh)
//!                                   │
//!                                   └──► BlobStore (fs / gcs)
//! ```
//!
//! Every capability at the edge is a trait, so the whole state machine runs
//! against the in-process doubles in [`mock`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod mock;
pub mod registry;
pub mod ssh;
pub mod task;
pub mod vm;

pub use config::Config;
pub use error::{ExecError, LauncherError, ProvisionError, RegistryError, TaskError};
pub use executor::RemoteExecutor;
pub use registry::TaskRegistry;
pub use task::{Launcher, TaskHandle, TaskSettings};
pub use vm::{VmLease, VmProvider};
