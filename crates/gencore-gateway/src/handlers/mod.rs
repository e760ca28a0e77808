//! HTTP and WebSocket request handlers.
//!
//! `completions` and `chat` share the request lifecycle implemented here:
//! validate → fingerprint → cache `do_or_wait` (non-streaming) or SSE
//! assembly (streaming), with a per-request cancellation token that fires
//! on client disconnect, server shutdown, or wall-clock timeout.

pub mod chat;
pub mod completions;
pub mod config_api;
pub mod models;
pub mod status;
pub mod ws;

use crate::openai;
use crate::state::{AppState, RequestGuard};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, stream};
use gencore_backend::{FinishReason, GenerationStream, TokenUsage};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which streaming frame schema to emit.
#[derive(Clone, Copy)]
pub(crate) enum StreamKind {
    Completion,
    Chat,
}

/// Per-request context: child cancellation token plus the wall-clock
/// timeout watchdog. The watchdog marks `timed_out` before cancelling so
/// downstream code can distinguish timeout from client disconnect.
///
/// Dropping the scope cancels the token, so abandoning the request (client
/// disconnect drops the handler future or the response stream) propagates
/// into the backend automatically.
pub(crate) struct RequestScope {
    pub cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    _cancel_on_drop: tokio_util::sync::DropGuard,
}

impl RequestScope {
    pub fn begin(state: &AppState) -> Self {
        let cancel = state.shutdown.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timeout = Duration::from_secs(state.config.snapshot().server.request_timeout_secs);
        {
            let cancel = cancel.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        timed_out.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                }
            });
        }
        Self {
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            timed_out,
        }
    }

    /// Whether the watchdog (rather than a disconnect or shutdown) fired
    /// this scope's cancellation.
    pub fn is_timeout(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// Assemble an SSE response from a backend stream.
///
/// Every chunk becomes one `data:` frame in the OpenAI streaming schema;
/// the terminal frame carries `finish_reason` and the usage block, then a
/// single `data: [DONE]` closes the stream. Backend errors (and timeouts)
/// become one `data: {"error": ...}` frame followed by `[DONE]`.
///
/// The request guard and the scope (whose drop fires cancellation) are
/// owned by the stream closure: when the client disconnects axum drops the
/// stream, which tears the backend call down.
pub(crate) fn sse_response(
    kind: StreamKind,
    id: String,
    model: String,
    prompt_tokens: u32,
    scope: RequestScope,
    request_guard: RequestGuard,
    stream: GenerationStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let created = openai::unix_now();
    let mut first = true;
    let mut completion_tokens = 0u32;

    let frames = stream.map(move |item| {
        // Owned by the closure so client disconnect tears the backend down.
        let _held = &request_guard;

        let value = match item {
            Ok(chunk) => {
                if let Some(mut reason) = chunk.finish_reason {
                    if reason == FinishReason::Cancelled && scope.is_timeout() {
                        reason = FinishReason::Error;
                    }
                    if reason == FinishReason::Error || chunk.error.is_some() {
                        let kind_tag = if scope.is_timeout() {
                            "timeout"
                        } else {
                            "generation_error"
                        };
                        json!({
                            "error": {
                                "message": chunk
                                    .error
                                    .unwrap_or_else(|| "generation failed".to_string()),
                                "type": kind_tag,
                            }
                        })
                    } else {
                        let usage = chunk
                            .usage
                            .unwrap_or_else(|| TokenUsage::new(prompt_tokens, completion_tokens));
                        let mut value = match kind {
                            StreamKind::Completion => openai::completion_chunk(
                                &id, created, &model, "", Some(reason),
                            ),
                            StreamKind::Chat => openai::chat_chunk(
                                &id, created, &model, "", first, Some(reason),
                            ),
                        };
                        value["usage"] = openai::usage_value(usage);
                        value
                    }
                } else {
                    completion_tokens += 1;
                    let value = match kind {
                        StreamKind::Completion => {
                            openai::completion_chunk(&id, created, &model, &chunk.delta, None)
                        }
                        StreamKind::Chat => {
                            openai::chat_chunk(&id, created, &model, &chunk.delta, first, None)
                        }
                    };
                    first = false;
                    value
                }
            }
            Err(e) => {
                debug!(error = %e, "stream error frame");
                json!({ "error": { "message": e.to_string(), "type": e.kind() } })
            }
        };
        Ok(Event::default().data(value.to_string()))
    });

    let done = stream::once(async { Ok(Event::default().data("[DONE]")) });
    Sse::new(frames.chain(done)).keep_alive(KeepAlive::default())
}

