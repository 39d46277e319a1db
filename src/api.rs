// src/api.rs
//! Public read API consumed by the UI layer. Every endpoint answers 200
//! with failure represented in-band (`fetch_status`, `last_error`);
//! readers are never shown a blank error screen.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::service::{FeedService, QuakesResponse, StatusResponse, WarningsResponse};

#[derive(Clone)]
pub struct AppState {
    pub service: FeedService,
}

pub fn create_router(service: FeedService) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/status", get(status))
        .route("/api/quakes", get(quakes))
        .route("/api/warnings/{area}", get(warnings))
        .layer(CorsLayer::very_permissive())
        .with_state(AppState { service })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.service.get_status())
}

async fn quakes(State(state): State<AppState>) -> Json<QuakesResponse> {
    Json(state.service.get_quakes().await)
}

async fn warnings(
    State(state): State<AppState>,
    Path(area): Path<String>,
) -> Json<WarningsResponse> {
    Json(state.service.get_warnings(&area).await)
}
