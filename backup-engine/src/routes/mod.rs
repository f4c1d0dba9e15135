pub mod backups;
pub mod hosts;
pub mod maintenance;
pub mod tasks;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/hosts", hosts::router(state.clone()))
        .nest("/api/backups", backups::router(state.clone()))
        .nest("/api/tasks", tasks::router(state.clone()))
        .nest("/api/maintenance", maintenance::router(state.clone()))
        .nest("/api/search", maintenance::search_router(state.clone()))
        .route("/ws", axum::routing::get(crate::ws::events::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
