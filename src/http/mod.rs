//! HTTP submission surface
//!
//! A thin axum front over the coordinator: callers upload an audio file,
//! the request waits for the worker's result and returns it verbatim. The
//! pool and counters are exposed for introspection; tokens never are.

use crate::distributed::{Coordinator, TaskError, TaskId, TaskPayload, AUDIO_TASK};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::instrument;

/// Largest accepted upload; base64 inflates it by a third on the wire
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("task {0} is not queued or running")]
    UnknownTask(TaskId),

    #[error("request body is empty")]
    EmptyBody,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Task(TaskError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Task(TaskError::WorkerLost { .. }) => StatusCode::BAD_GATEWAY,
            Self::Task(TaskError::Cancelled(_)) => StatusCode::CONFLICT,
            Self::Task(TaskError::Dropped(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidTaskId(_) | Self::EmptyBody => StatusCode::BAD_REQUEST,
            Self::UnknownTask(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ComputeQuery {
    /// Task tag, `audio` when omitted
    task: Option<String>,
    filename: Option<String>,
}

/// Build the router over a coordinator
pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/pool", get(pool))
        .route("/stats", get(stats))
        .route("/compute", post(compute))
        .route("/tasks/:id", delete(cancel))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(coordinator)
}

/// Bind `addr` and serve HTTP until the listener fails
pub async fn serve(addr: &str, coordinator: Coordinator) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;

    tracing::info!("Serving HTTP on {}", addr);
    axum::serve(listener, router(coordinator))
        .await
        .context("HTTP server failed")
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "voicepool coordinator" }))
}

async fn pool(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    Json(coordinator.workers())
}

async fn stats(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    Json(coordinator.stats())
}

#[instrument(name = "compute", skip(coordinator, body), fields(bytes = body.len()))]
async fn compute(
    State(coordinator): State<Coordinator>,
    Query(query): Query<ComputeQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyBody);
    }

    let task = query.task.unwrap_or_else(|| AUDIO_TASK.to_string());
    let filename = query.filename.unwrap_or_default();

    let handle = coordinator.submit(TaskPayload::file(task, &filename, &body));
    let mut guard = CancelOnDrop {
        coordinator: coordinator.clone(),
        id: handle.id(),
        armed: true,
    };

    let outcome = handle.wait_timeout(coordinator.config().submit_timeout()).await;

    // Nobody is left to receive a timed-out result; the guard frees the slot
    guard.armed = matches!(outcome, Err(TaskError::Timeout(_)));
    outcome.map(Json).map_err(ApiError::from)
}

/// Cancels a submitted task unless disarmed
///
/// axum drops the handler future when the client disconnects, so the
/// cancel has to happen on drop rather than after the await.
struct CancelOnDrop {
    coordinator: Coordinator,
    id: TaskId,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.coordinator.cancel(self.id) {
            tracing::info!(task = %self.id, "Caller went away, task cancelled");
        }
    }
}

async fn cancel(State(coordinator): State<Coordinator>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id: TaskId = id.parse().map_err(|_| ApiError::InvalidTaskId(id.clone()))?;

    if coordinator.cancel(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::UnknownTask(id))
    }
}
