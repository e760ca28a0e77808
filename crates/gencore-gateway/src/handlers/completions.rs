//! `POST /v1/completions` — plain-prompt completion, cached and streamed.

use super::{RequestScope, StreamKind, sse_response};
use crate::error::ApiError;
use crate::openai::{self, CompletionRequest, sampling_key};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use gencore_backend::{BackendError, FinishReason, SamplingParams};
use gencore_cache::{CacheError, completion_fingerprint};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CompletionRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?;
    let (params, stream) = request.validate()?;
    let model = state.backend.model_id();
    let guard = state.connections.clone().begin_request();
    let scope = RequestScope::begin(&state);

    if stream {
        let prompt_tokens = state.backend.count_tokens(&request.prompt).await;
        let backend_stream = state
            .backend
            .generate_stream(&request.prompt, &params, scope.cancel.clone())
            .await?;
        let id = openai::new_completion_id();
        info!(id = %id, model = %model, "streaming completion started");
        return Ok(sse_response(
            StreamKind::Completion,
            id,
            model,
            prompt_tokens,
            scope,
            guard,
            backend_stream,
        )
        .into_response());
    }

    let config = state.config.snapshot();
    let fingerprint = completion_fingerprint(
        &model,
        &request.prompt,
        &sampling_key(&params),
        config.cache.canonicalize_whitespace,
    );

    // A fired token (timeout or disconnect) abandons the wait; if this task
    // was the producer, the single-flight table promotes the next waiter.
    let produced = tokio::select! {
        r = state.cache.do_or_wait(&fingerprint, || {
            produce_completion(
                state.clone(),
                request.prompt.clone(),
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
            info!(model = %model, fingerprint = %fingerprint, "completion served");
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

/// Cache producer: runs the backend and serializes the OpenAI envelope as
/// the cached body. Errors cross the single-flight boundary in wire form
/// so every waiter reconstructs the original kind; cancelled generations
/// are reported as errors and never cached.
async fn produce_completion(
    state: AppState,
    prompt: String,
    params: SamplingParams,
    cancel: CancellationToken,
) -> Result<String, String> {
    let result = state
        .backend
        .generate(&prompt, &params, cancel)
        .await
        .map_err(|e| ApiError::from(e).to_wire())?;
    if result.finish_reason == FinishReason::Cancelled {
        return Err(ApiError::Backend(BackendError::Cancelled).to_wire());
    }

    let id = openai::new_completion_id();
    let envelope = openai::completion_response(
        &id,
        &result.model,
        &result.text,
        result.finish_reason,
        result.usage,
    );
    Ok(envelope.to_string())
}
