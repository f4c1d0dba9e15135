use crate::error::AppError;
use crate::models::backup_task::{BackupTask, CreateBackupTaskRequest};
use crate::services::browse::{self, FileEntry, VersionInfo};
use crate::services::error_log::{self, ErrorPage, DEFAULT_PAGE_SIZE};
use crate::services::orchestrator::{self, RunTicket};
use crate::services::restore::{self, RestoreSelection, RestoreTarget};
use crate::services::catalog;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/{id}", get(get_backup).delete(delete_backup))
        .route("/{id}/run", post(run_backup))
        .route("/{id}/enabled", put(set_enabled))
        .route("/{id}/errors", get(list_errors).delete(clear_errors))
        .route("/{id}/versions", get(list_versions))
        .route("/{id}/files", get(list_files))
        .route("/{id}/restore", post(restore_backup))
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupTask>>, AppError> {
    Ok(Json(catalog::list_backup_tasks(&state).await?))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupTask>, AppError> {
    Ok(Json(catalog::get_backup_task(&state, &id).await?))
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBackupTaskRequest>,
) -> Result<(StatusCode, Json<BackupTask>), AppError> {
    let task = catalog::create_backup_task(&state, body).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    catalog::delete_backup_task(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunTicket>), AppError> {
    let handle = orchestrator::run_backup_task(state.clone(), &id).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.ticket())))
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_enabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<BackupTask>, AppError> {
    Ok(Json(catalog::set_task_enabled(&state, &id, body.enabled).await?))
}

#[derive(Deserialize)]
struct ErrorsQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_errors(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ErrorsQuery>,
) -> Result<Json<ErrorPage>, AppError> {
    let page = error_log::list_backup_errors(
        &state,
        &id,
        query.page.unwrap_or(1),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    )
    .await?;
    Ok(Json(page))
}

async fn clear_errors(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    error_log::clear_backup_errors(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<VersionInfo>>, AppError> {
    Ok(Json(browse::list_backup_versions(&state, &id).await?))
}

#[derive(Deserialize)]
struct FilesQuery {
    version: Option<String>,
    path: Option<String>,
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Vec<FileEntry>>, AppError> {
    let files = browse::list_files(&state, &id, query.version.as_deref(), query.path.as_deref()).await?;
    Ok(Json(files))
}

#[derive(Deserialize)]
struct RestoreBody {
    #[serde(flatten)]
    selection: RestoreSelection,
    target: RestoreTarget,
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let task_id = restore::restore_backup(state.clone(), &id, body.selection, body.target).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "taskId": task_id }))))
}
