//! GenCore gateway — OpenAI-compatible HTTP/WebSocket server over local and
//! remote LLM backends.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/v1/status` | Uptime, model id, connections, cache stats. |
//! | `GET`  | `/v1/models` | The single loaded model. |
//! | `POST` | `/v1/completions` | Completion; SSE when `stream: true`. |
//! | `POST` | `/v1/chat/completions` | Chat completion; SSE when `stream: true`. |
//! | `GET`  | `/v1/config` | Redacted configuration snapshot. |
//! | `POST` | `/v1/config` | Merge a config update; flags reload needs. |
//! | `WS`   | `/ws/completions` | Bidirectional completion/chat jobs. |
//!
//! Authentication is Bearer-key based and enabled whenever the configured
//! key list is non-empty. Non-streaming responses flow through the
//! fingerprint cache with single-flight coalescing; streaming responses
//! bypass the cache.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod openai;
pub mod server;
pub mod state;

pub use config::{BackendKind, ConfigHandle, GatewayConfig};
pub use error::ApiError;
pub use server::{ServerError, build_router, build_state, serve};
pub use state::AppState;
