//! Health check endpoint.

use crate::task::Launcher;
use axum::{Extension, Json};
use kvas_types::TaskState;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Tasks launched since startup.
    pub tasks: usize,
    /// Runs that have not ended yet.
    pub active: usize,
    /// Tasks that ended in FAILURE.
    pub failed: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(launcher): Extension<Arc<Launcher>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);
    let registry = launcher.registry();

    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tasks: registry.len(),
        active: launcher.active_runs(),
        failed: registry.count_in(TaskState::Failure),
        uptime_seconds: uptime,
    })
}
