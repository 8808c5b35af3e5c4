//! HTTP endpoints for kvas-launcher.
//!
//! Launch, poll and cancel tasks, list their archived logs, and a health
//! check.

pub mod health;
mod tasks;

use crate::task::Launcher;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;

pub use health::HealthStatus;
pub use tasks::ApiError;

/// Build the HTTP router with all endpoints.
pub fn build_router(launcher: Arc<Launcher>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/test", post(tasks::launch_handler))
        .route("/api/test/:id", get(tasks::get_handler))
        .route("/api/test/:id/cancel", post(tasks::cancel_handler))
        .route("/api/logs/:id", get(tasks::logs_handler))
        .layer(Extension(launcher))
}
