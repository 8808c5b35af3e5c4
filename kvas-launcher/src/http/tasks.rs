//! Task endpoints.

use crate::error::{RegistryError, TaskError};
use crate::task::Launcher;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use kvas_types::{LaunchRequest, LogArtifact, TaskId, TaskSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Error answered by the task endpoints.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed or invalid request (400).
    BadRequest(String),
    /// Unknown task (404).
    NotFound(TaskId),
    /// The launcher is shutting down (503).
    Unavailable(String),
    /// Anything else (500).
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("task not found: {}", id)),
            ApiError::Unavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
            ApiError::Internal(reason) => (StatusCode::INTERNAL_SERVER_ERROR, reason),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::InvalidRequest(e) => ApiError::BadRequest(e.to_string()),
            TaskError::Registry(RegistryError::NotFound(id)) => ApiError::NotFound(id),
            TaskError::ShuttingDown => ApiError::Unavailable(TaskError::ShuttingDown.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|e: kvas_types::TypesError| ApiError::BadRequest(e.to_string()))
}

/// Query of `POST /api/test`.
#[derive(Debug, Deserialize)]
pub struct LaunchParams {
    image: String,
    node_count: u32,
    #[serde(default)]
    task: Option<String>,
}

/// Answer of `POST /api/test/{id}/cancel`.
#[derive(Serialize)]
pub struct CancelResponse {
    /// False when the run had already ended.
    cancelled: bool,
}

/// `POST /api/test?image=&node_count=&task=`
pub async fn launch_handler(
    Extension(launcher): Extension<Arc<Launcher>>,
    Query(params): Query<LaunchParams>,
) -> Result<(StatusCode, Json<TaskSnapshot>), ApiError> {
    let topology = params.task.as_deref().unwrap_or("replication");
    let request = LaunchRequest::parse(&params.image, params.node_count, topology)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let handle = launcher.launch_task(request)?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot)))
}

/// `GET /api/test/{id}`
pub async fn get_handler(
    Extension(launcher): Extension<Arc<Launcher>>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let id = parse_id(&id)?;
    launcher
        .get_task(&id)
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

/// `POST /api/test/{id}/cancel`
pub async fn cancel_handler(
    Extension(launcher): Extension<Arc<Launcher>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = parse_id(&id)?;
    if launcher.get_task(&id).is_none() {
        return Err(ApiError::NotFound(id));
    }
    Ok(Json(CancelResponse {
        cancelled: launcher.cancel_task(&id),
    }))
}

/// `GET /api/logs/{id}`
pub async fn logs_handler(
    Extension(launcher): Extension<Arc<Launcher>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogArtifact>>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(launcher.list_logs(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvas_types::TypesError;

    #[test]
    fn task_errors_map_to_statuses() {
        let bad: ApiError = TaskError::InvalidRequest(TypesError::EmptyImage).into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let id = TaskId::new();
        let missing: ApiError = TaskError::Registry(RegistryError::NotFound(id)).into();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let closing: ApiError = TaskError::ShuttingDown.into();
        assert_eq!(
            closing.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let other: ApiError = TaskError::Cancelled.into();
        assert_eq!(
            other.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn ids_are_validated() {
        assert!(parse_id("not-a-uuid").is_err());
        assert!(parse_id(&TaskId::new().to_string()).is_ok());
    }
}
