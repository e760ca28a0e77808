//! `GET /v1/config` and `POST /v1/config`.
//!
//! GET returns the current snapshot with secrets redacted. POST merges a
//! JSON object into a copy of the snapshot, validates it, publishes the
//! new snapshot, and reports whether the change needs a model reload to
//! take full effect (changes under `model` or `backend` do; the running
//! backend instance is not swapped in place).

use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::{Value, json};
use tracing::info;

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.snapshot().redacted())
}

pub async fn update_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state.config.snapshot();
    let (updated, reload_required) = current
        .merge_update(&patch)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    state.config.replace(updated);
    info!(reload_required, "configuration updated");
    Ok(Json(json!({
        "status": "ok",
        "reload_required": reload_required,
    })))
}
