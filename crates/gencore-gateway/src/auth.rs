//! API-key authentication middleware.
//!
//! A non-empty `auth.api_keys` list enables auth; requests must then carry
//! `Authorization: Bearer <key>`. With an empty list everything passes
//! (development mode). `GET /v1/models` may be exempted by configuration so
//! unauthenticated clients can discover the model.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.config.snapshot();
    if config.auth.api_keys.is_empty() {
        return next.run(request).await;
    }
    if config.auth.allow_unauthenticated_models
        && request.method() == axum::http::Method::GET
        && request.uri().path() == "/v1/models"
    {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(key) if config.auth.api_keys.iter().any(|k| k == key) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "rejected request: invalid API key");
            state.connections.record_error();
            ApiError::Unauthorized.into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "rejected request: missing API key");
            state.connections.record_error();
            ApiError::Unauthorized.into_response()
        }
    }
}
