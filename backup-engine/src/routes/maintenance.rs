use crate::error::AppError;
use crate::services::browse::{self, FileMatch, MAX_SEARCH_RESULTS};
use crate::services::maintenance::{self, PurgeSummary};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/purge", post(purge))
}

pub fn search_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(search_files))
}

#[derive(Deserialize)]
struct SearchQuery {
    pattern: String,
    limit: Option<usize>,
}

async fn search_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<FileMatch>>, AppError> {
    let limit = query.limit.unwrap_or(MAX_SEARCH_RESULTS);
    Ok(Json(browse::search_files(&state, &query.pattern, limit).await?))
}

async fn purge(State(state): State<Arc<AppState>>) -> Result<Json<PurgeSummary>, AppError> {
    Ok(Json(maintenance::purge_expired_versions(&state).await?))
}
