//! `GET /v1/status` — process, connection, and cache statistics.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.cache.stats();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "model": state.backend.model_id(),
        "connections": {
            "active_requests": state.connections.active_requests(),
            "ws_sessions": state.connections.ws_sessions(),
            "errors": state.connections.errors(),
        },
        "cache": cache,
    }))
}
