use crate::error::AppError;
use crate::models::backup_task::BackupTask;
use crate::models::host::{CreateHostRequest, Host};
use crate::services::catalog;
use crate::services::orchestrator::{self, RunTicket};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_hosts).post(create_host))
        .route("/{id}", get(get_host).delete(delete_host))
        .route("/{id}/backups", get(list_host_backups))
        .route("/{id}/run", post(run_all_for_host))
}

async fn list_hosts(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Host>>, AppError> {
    Ok(Json(catalog::list_hosts(&state).await?))
}

async fn get_host(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Host>, AppError> {
    Ok(Json(catalog::get_host(&state, &id).await?))
}

async fn create_host(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateHostRequest>,
) -> Result<(StatusCode, Json<Host>), AppError> {
    let host = catalog::create_host(&state, body).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

async fn delete_host(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    catalog::delete_host(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_host_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<BackupTask>>, AppError> {
    Ok(Json(catalog::list_host_tasks(&state, &id).await?))
}

async fn run_all_for_host(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Vec<RunTicket>>), AppError> {
    let handles = orchestrator::run_all_for_host(state.clone(), &id).await?;
    let tickets = handles.iter().map(|h| h.ticket()).collect();
    Ok((StatusCode::ACCEPTED, Json(tickets)))
}
