//! `GET /v1/models` — the single loaded model, OpenAI list shape.

use crate::openai;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.backend.model_id(),
            "object": "model",
            "created": openai::unix_now(),
            "owned_by": "gencore",
        }],
    }))
}
