//! Health and status handlers.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::state::AppState;

/// Liveness check.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Active sessions and metadata cache occupancy.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.downloader.snapshot())
}
