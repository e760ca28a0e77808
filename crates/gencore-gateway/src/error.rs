//! Gateway error types and their OpenAI error-envelope rendering.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gencore_backend::BackendError;
use serde_json::json;
use thiserror::Error;

/// API-level errors. Every variant renders as the standard OpenAI error
/// envelope `{"error": {"message", "type", "code"}}` with the matching
/// HTTP status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Backend(BackendError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable error-type tag used in envelopes and producer broadcasts.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Validation(_) => "request_invalid",
            ApiError::ModelUnavailable(_) => "model_unavailable",
            ApiError::Timeout => "timeout",
            ApiError::Backend(e) => e.kind(),
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Backend(e) => match e {
                BackendError::ModelUnavailable(_) | BackendError::Busy(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                BackendError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BackendError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
                BackendError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BackendError::UpstreamIo { .. } | BackendError::UpstreamHttp { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                BackendError::Cancelled | BackendError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Serialize for broadcast to cache waiters; [`ApiError::from_wire`]
    /// reconstructs the kind on the other side.
    pub fn to_wire(&self) -> String {
        json!({ "type": self.kind(), "message": self.to_string() }).to_string()
    }

    pub fn from_wire(wire: &str) -> ApiError {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(wire) else {
            return ApiError::Internal(wire.to_string());
        };
        let message = value["message"].as_str().unwrap_or(wire).to_string();
        match value["type"].as_str().unwrap_or("internal") {
            "unauthorized" => ApiError::Unauthorized,
            "request_invalid" => ApiError::Validation(message),
            "model_unavailable" => ApiError::ModelUnavailable(message),
            "timeout" => ApiError::Timeout,
            "backend_busy" => ApiError::Backend(BackendError::Busy(message)),
            "cancelled" => ApiError::Backend(BackendError::Cancelled),
            "upstream_io" => ApiError::Backend(BackendError::UpstreamIo {
                attempts: 0,
                message,
            }),
            "upstream_http" => ApiError::Backend(BackendError::UpstreamHttp {
                status: 0,
                message,
            }),
            "not_supported" => ApiError::Backend(BackendError::NotSupported(message)),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        ApiError::Backend(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}
