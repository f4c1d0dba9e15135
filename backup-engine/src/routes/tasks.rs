use crate::error::AppError;
use crate::services::size_estimator::{self, TaskResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for `?wait=` long polling, in seconds.
const MAX_WAIT_SECS: u64 = 30;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/measure-size", post(measure_size))
        .route("/{id}", get(get_task_result))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeasureSizeBody {
    host_id: String,
    path: String,
}

async fn measure_size(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MeasureSizeBody>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if body.path.trim().is_empty() {
        return Err(AppError::BadRequest("path is required".into()));
    }
    let task_id = size_estimator::measure_size(state.clone(), &body.host_id, &body.path).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "taskId": task_id }))))
}

#[derive(Deserialize)]
struct ResultQuery {
    /// Seconds to wait for a terminal state before answering.
    wait: Option<u64>,
}

async fn get_task_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<TaskResult>, AppError> {
    let result = match query.wait.filter(|w| *w > 0) {
        Some(wait) => {
            let timeout = Duration::from_secs(wait.min(MAX_WAIT_SECS));
            size_estimator::await_task_result(&state, &id, timeout).await
        }
        None => size_estimator::get_task_result(&state, &id),
    };
    result
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Task not found or expired".into()))
}
