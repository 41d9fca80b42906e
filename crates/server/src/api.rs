//! HTTP surface: health, chat WebSocket, task REST API and static files.

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use promptdock_protocol::{RunDetail, RunSummary};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::state::AppState;
use crate::tasks::{run_task, TaskError};
use crate::websocket::ws_handler;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Run not found: {0}")]
    RunNotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Task(TaskError::NotFound(_)) | ApiError::RunNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Task(TaskError::Disabled(_)) => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>, public_dir: &Path) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/tasks/{name}/run", post(run_task_handler))
        .route("/api/sessions", get(list_runs_handler))
        .route("/api/sessions/{id}", get(get_run_handler))
        .fallback_service(ServeDir::new(public_dir))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn run_task_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> Result<(StatusCode, Json<RunSummary>), ApiError> {
    let (summary, _handle) = run_task(&state, &name)?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

async fn list_runs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RunSummary>> {
    Json(state.runs.list())
}

async fn get_run_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<RunDetail>, ApiError> {
    state
        .runs
        .get(&id)
        .map(Json)
        .ok_or(ApiError::RunNotFound(id))
}
