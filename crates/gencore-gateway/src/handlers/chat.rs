//! `POST /v1/chat/completions` — chat messages in, assistant message out.

use super::{RequestScope, StreamKind, sse_response};
use crate::error::ApiError;
use crate::openai::{self, ChatCompletionRequest, sampling_key};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use gencore_backend::{BackendError, ChatMessage, FinishReason, SamplingParams};
use gencore_cache::{CacheError, chat_fingerprint};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?;
    let (messages, params, stream) = request.validate()?;
    let model = state.backend.model_id();
    let guard = state.connections.clone().begin_request();
    let scope = RequestScope::begin(&state);

    if stream {
        let concatenated = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt_tokens = state.backend.count_tokens(&concatenated).await;
        let backend_stream = state
            .backend
            .chat_stream(&messages, &params, scope.cancel.clone())
            .await?;
        let id = openai::new_chat_id();
        info!(id = %id, model = %model, "streaming chat completion started");
        return Ok(sse_response(
            StreamKind::Chat,
            id,
            model,
            prompt_tokens,
            scope,
            guard,
            backend_stream,
        )
        .into_response());
    }

    let pairs: Vec<(String, String)> = messages
        .iter()
        .map(|m| (m.role.as_str().to_string(), m.content.clone()))
        .collect();
    let fingerprint = chat_fingerprint(&model, &pairs, &sampling_key(&params));

    let produced = tokio::select! {
        r = state.cache.do_or_wait(&fingerprint, || {
            produce_chat(
                state.clone(),
                messages.clone(),
                params.clone(),
                scope.cancel.clone(),
            )
        }) => r,
        _ = scope.cancel.cancelled() => {
            state.connections.record_error();
            return Err(if scope.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Backend(BackendError::Cancelled)
            });
        }
    };

    match produced {
        Ok(body) => {
            info!(model = %model, fingerprint = %fingerprint, "chat completion served");
            Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
        }
        Err(CacheError::Producer(wire)) => {
            state.connections.record_error();
            Err(if scope.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::from_wire(&wire)
            })
        }
    }
}

async fn produce_chat(
    state: AppState,
    messages: Vec<ChatMessage>,
    params: SamplingParams,
    cancel: CancellationToken,
) -> Result<String, String> {
    let result = state
        .backend
        .chat(&messages, &params, cancel)
        .await
        .map_err(|e| ApiError::from(e).to_wire())?;
    if result.finish_reason == FinishReason::Cancelled {
        return Err(ApiError::Backend(BackendError::Cancelled).to_wire());
    }

    let id = openai::new_chat_id();
    let envelope = openai::chat_response(
        &id,
        &result.model,
        &result.text,
        result.finish_reason,
        result.usage,
    );
    Ok(envelope.to_string())
}
