//! `WS /ws/completions` — bidirectional completion channel.
//!
//! Each inbound JSON frame is one job: `{"type": "completion", ...}` or
//! `{"type": "chat", ...}` with the same parameter set as the HTTP
//! endpoints. The server answers with sequential `*_chunk` frames and one
//! `*_finished` frame; any failure produces an `{"error": ...}` frame that
//! terminates the job (not the socket). Jobs on one socket run
//! sequentially; closing the socket cancels the active job.

use super::RequestScope;
use crate::openai::{ChatCompletionRequest, CompletionRequest};
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use gencore_backend::{FinishReason, GenerationStream};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

pub async fn ws_completions(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let _guard = state.connections.clone().begin_ws();
    info!("websocket session opened");
    let (mut sink, mut inbound) = socket.split();

    loop {
        let message = tokio::select! {
            // Shutdown closes idle sessions with a normal closure code.
            _ = state.shutdown.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                break;
            }
            message = inbound.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if run_ws_job(&state, text.as_str(), &mut sink).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong are answered by axum itself
            Some(Err(e)) => {
                debug!(error = %e, "websocket receive error");
                break;
            }
        }
    }
    info!("websocket session closed");
}

/// Execute one job frame. `Err(())` means the peer is gone and the socket
/// loop should stop; job-level failures are reported in-band and return
/// `Ok`.
pub(crate) async fn run_ws_job<S>(state: &AppState, raw: &str, sink: &mut S) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            return send_json(sink, &json!({ "error": format!("invalid frame: {e}") })).await;
        }
    };
    let job_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    match value.get("type").and_then(|v| v.as_str()) {
        Some("completion") => {
            let request: CompletionRequest = match serde_json::from_value(value.clone()) {
                Ok(request) => request,
                Err(e) => {
                    return send_json(sink, &json!({ "id": job_id, "error": e.to_string() }))
                        .await;
                }
            };
            let (params, _) = match request.validate() {
                Ok(validated) => validated,
                Err(e) => {
                    return send_json(sink, &json!({ "id": job_id, "error": e.to_string() }))
                        .await;
                }
            };
            let scope = RequestScope::begin(state);
            match state
                .backend
                .generate_stream(&request.prompt, &params, scope.cancel.clone())
                .await
            {
                Ok(stream) => {
                    pump_job(job_id, "completion", "text", stream, scope, sink).await
                }
                Err(e) => send_json(sink, &json!({ "id": job_id, "error": e.to_string() })).await,
            }
        }
        Some("chat") => {
            let request: ChatCompletionRequest = match serde_json::from_value(value.clone()) {
                Ok(request) => request,
                Err(e) => {
                    return send_json(sink, &json!({ "id": job_id, "error": e.to_string() }))
                        .await;
                }
            };
            let (messages, params, _) = match request.validate() {
                Ok(validated) => validated,
                Err(e) => {
                    return send_json(sink, &json!({ "id": job_id, "error": e.to_string() }))
                        .await;
                }
            };
            let scope = RequestScope::begin(state);
            match state
                .backend
                .chat_stream(&messages, &params, scope.cancel.clone())
                .await
            {
                Ok(stream) => pump_job(job_id, "chat", "content", stream, scope, sink).await,
                Err(e) => send_json(sink, &json!({ "id": job_id, "error": e.to_string() })).await,
            }
        }
        _ => {
            send_json(
                sink,
                &json!({ "id": job_id, "error": "unknown job type; expected 'completion' or 'chat'" }),
            )
            .await
        }
    }
}

async fn pump_job<S>(
    job_id: String,
    prefix: &str,
    field: &str,
    mut stream: GenerationStream,
    scope: RequestScope,
    sink: &mut S,
) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(item) = stream.next().await {
        let frame = match item {
            Ok(chunk) => {
                if let Some(reason) = chunk.finish_reason {
                    let frame = if reason == FinishReason::Error || chunk.error.is_some() {
                        let message = if scope.is_timeout() {
                            "request timed out".to_string()
                        } else {
                            chunk.error.unwrap_or_else(|| "generation failed".into())
                        };
                        json!({ "id": job_id, "error": message })
                    } else {
                        let mut frame = json!({
                            "id": job_id,
                            "type": format!("{prefix}_finished"),
                            "finish_reason": reason.as_str(),
                        });
                        if let Some(usage) = chunk.usage {
                            frame["usage"] = crate::openai::usage_value(usage);
                        }
                        frame
                    };
                    return send_json(sink, &frame).await;
                }
                json!({ "id": job_id, "type": format!("{prefix}_chunk"), field: chunk.delta })
            }
            Err(e) => {
                let frame = json!({ "id": job_id, "error": e.to_string() });
                return send_json(sink, &frame).await;
            }
        };
        if send_json(sink, &frame).await.is_err() {
            // Peer disconnected mid-stream: cancel the backend call.
            scope.cancel.cancel();
            return Err(());
        }
    }
    Ok(())
}

async fn send_json<S>(sink: &mut S, value: &Value) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(value.to_string().into()))
        .await
        .map_err(|e| {
            debug!(error = %e, "websocket send failed");
        })
}
