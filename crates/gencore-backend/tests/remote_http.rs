//! Remote backend integration tests against an in-process HTTP fixture.
//!
//! The fixture is a small axum app bound to an ephemeral port. It can be
//! told to stall the first N requests past the client timeout, which is how
//! the transport-retry path is exercised deterministically.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use futures::StreamExt;
use gencore_backend::{
    BackendError, ChatMessage, FinishReason, LlmBackend, RemoteBackend, RemoteConfig, RetryPolicy,
    SamplingParams,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    requests: AtomicUsize,
    /// Stall this many initial requests past the client timeout.
    stall_first: usize,
}

async fn completions(
    State(fixture): State<Arc<Fixture>>,
    Json(_body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let n = fixture.requests.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= fixture.stall_first {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Json(json!({
        "id": "cmpl-1",
        "object": "text_completion",
        "model": "fixture-model",
        "choices": [{"index": 0, "text": "pong", "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3},
    }))
    .into_response()
}

async fn chat_completions(
    State(fixture): State<Arc<Fixture>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    fixture.requests.fetch_add(1, Ordering::SeqCst);
    let echoed = body["messages"][0]["content"].as_str().unwrap_or("").to_string();
    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "fixture-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("echo: {echoed}")},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7},
    }))
    .into_response()
}

fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    headers
}

async fn streaming_completions(
    State(fixture): State<Arc<Fixture>>,
    Json(_body): Json<serde_json::Value>,
) -> impl IntoResponse {
    fixture.requests.fetch_add(1, Ordering::SeqCst);
    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"text\":\"Hel\"}]}\n\n",
        "event: keepalive\n\n",
        "data: {\"choices\":[{\"index\":0,\"text\":\"lo\"}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"text\":\"\",\"finish_reason\":\"length\"}],\
         \"usage\":{\"prompt_tokens\":2,\"completion_tokens\":8,\"total_tokens\":10}}\n\n",
        "data: [DONE]\n\n",
    );
    (sse_headers(), body).into_response()
}

async fn truncated_stream(
    State(fixture): State<Arc<Fixture>>,
    Json(_body): Json<serde_json::Value>,
) -> impl IntoResponse {
    fixture.requests.fetch_add(1, Ordering::SeqCst);
    (
        sse_headers(),
        "data: {\"choices\":[{\"index\":0,\"text\":\"partial\"}]}\n\n",
    )
        .into_response()
}

async fn not_found(State(fixture): State<Arc<Fixture>>) -> impl IntoResponse {
    fixture.requests.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"message": "model not found"}})),
    )
        .into_response()
}

async fn embeddings(
    State(fixture): State<Arc<Fixture>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    fixture.requests.fetch_add(1, Ordering::SeqCst);
    let inputs = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
    let data: Vec<_> = (0..inputs)
        .map(|i| json!({"index": i, "embedding": [0.1, 0.2, 0.3]}))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn spawn_fixture(stall_first: usize, router: fn(Arc<Fixture>) -> axum::Router) -> (SocketAddr, Arc<Fixture>) {
    let fixture = Arc::new(Fixture {
        requests: AtomicUsize::new(0),
        stall_first,
    });
    let app = router(fixture.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, fixture)
}

fn default_router(fixture: Arc<Fixture>) -> axum::Router {
    axum::Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .with_state(fixture)
}

fn backend_for(addr: SocketAddr, request_timeout: Duration) -> Arc<RemoteBackend> {
    RemoteBackend::new(RemoteConfig {
        base_url: format!("http://{addr}/v1"),
        model: "fixture-model".into(),
        request_timeout,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        },
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_generate_round_trip() {
    let (addr, fixture) = spawn_fixture(0, default_router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let result = backend
        .generate("ping", &SamplingParams::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text, "pong");
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.usage.total_tokens, 3);
    assert_eq!(result.model, "fixture-model");
    assert_eq!(result.metadata["attempts"], json!(1));
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_recovers_after_two_timeouts() {
    // First two requests stall past the 100ms client timeout, the third
    // responds promptly: the call succeeds with exactly 3 attempts recorded.
    let (addr, fixture) = spawn_fixture(2, default_router).await;
    let backend = backend_for(addr, Duration::from_millis(100));

    let result = backend
        .generate("ping", &SamplingParams::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text, "pong");
    assert_eq!(result.metadata["attempts"], json!(3));
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_gives_up_after_bounded_attempts() {
    let (addr, fixture) = spawn_fixture(10, default_router).await;
    let backend = backend_for(addr, Duration::from_millis(50));

    let err = backend
        .generate("ping", &SamplingParams::default(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        BackendError::UpstreamIo { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected UpstreamIo, got {other:?}"),
    }
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_http_errors_are_not_retried() {
    fn router(fixture: Arc<Fixture>) -> axum::Router {
        axum::Router::new()
            .route("/v1/completions", post(not_found))
            .with_state(fixture)
    }
    let (addr, fixture) = spawn_fixture(0, router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let err = backend
        .generate("ping", &SamplingParams::default(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        BackendError::UpstreamHttp { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("model not found"));
        }
        other => panic!("expected UpstreamHttp, got {other:?}"),
    }
    assert_eq!(
        fixture.requests.load(Ordering::SeqCst),
        1,
        "4xx must not be retried"
    );
}

#[tokio::test]
async fn test_chat_uses_chat_endpoint() {
    let (addr, _fixture) = spawn_fixture(0, default_router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let result = backend
        .chat(
            &[ChatMessage::user("hello there")],
            &SamplingParams::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.text, "echo: hello there");
    assert_eq!(result.usage.total_tokens, 7);
}

#[tokio::test]
async fn test_streaming_parses_sse_until_terminal() {
    fn router(fixture: Arc<Fixture>) -> axum::Router {
        axum::Router::new()
            .route("/v1/completions", post(streaming_completions))
            .with_state(fixture)
    }
    let (addr, _fixture) = spawn_fixture(0, router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let mut stream = backend
        .generate_stream("hi", &SamplingParams::default(), CancellationToken::new())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    let mut terminal = None;
    while let Some(item) = stream.next().await {
        let chunk = item.unwrap();
        if chunk.is_terminal() {
            terminal = Some(chunk);
            break;
        }
        deltas.push(chunk.delta);
    }

    assert_eq!(deltas, vec!["Hel", "lo"]);
    let terminal = terminal.expect("stream must terminate");
    assert_eq!(terminal.finish_reason, Some(FinishReason::Length));
    assert_eq!(terminal.usage.unwrap().completion_tokens, 8);
    assert!(stream.next().await.is_none(), "nothing after the terminal chunk");
}

#[tokio::test]
async fn test_stream_ending_without_done_is_an_error() {
    fn router(fixture: Arc<Fixture>) -> axum::Router {
        axum::Router::new()
            .route("/v1/completions", post(truncated_stream))
            .with_state(fixture)
    }
    let (addr, _fixture) = spawn_fixture(0, router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let mut stream = backend
        .generate_stream("hi", &SamplingParams::default(), CancellationToken::new())
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.delta, "partial");
    match stream.next().await {
        Some(Err(BackendError::UpstreamIo { message, .. })) => {
            assert!(message.contains("[DONE]"));
        }
        other => panic!("expected terminal error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_embed_maps_to_embeddings_endpoint() {
    let (addr, _fixture) = spawn_fixture(0, default_router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let vectors = backend
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn test_cancelled_token_short_circuits() {
    let (addr, fixture) = spawn_fixture(0, default_router).await;
    let backend = backend_for(addr, Duration::from_secs(5));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = backend
        .generate("ping", &SamplingParams::default(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Cancelled));
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_count_tokens_is_len_over_four() {
    let (addr, _fixture) = spawn_fixture(0, default_router).await;
    let backend = backend_for(addr, Duration::from_secs(5));
    assert_eq!(backend.count_tokens("abcdefgh").await, 3);
}
