//! Remote OpenAI-compatible backend.
//!
//! Drives `/completions`, `/chat/completions`, and `/embeddings` on any
//! OpenAI-compatible server (llama.cpp server, Ollama, vLLM, OpenAI
//! itself) over a pooled keep-alive [`reqwest::Client`].
//!
//! Retry policy: connection and timeout errors are retried with
//! exponential backoff up to a bounded attempt count; HTTP 4xx/5xx are
//! never retried and surface as [`BackendError::UpstreamHttp`] so callers
//! can inspect the structured upstream body. The attempt count that
//! finally succeeded is recorded in result metadata.
//!
//! Streaming uses server-sent-events framing: only `data: `-prefixed lines
//! are events, `data: [DONE]` terminates.

use crate::traits::{GenerationStream, LlmBackend};
use crate::types::{
    BackendError, ChatMessage, FinishReason, GenerationChunk, GenerationResult, SamplingParams,
    TokenUsage,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff/attempt bounds for transport-level failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Remote endpoint configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL including the API prefix, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub connect_timeout: Duration,
    /// Applies to the first response byte; streams may run longer.
    pub request_timeout: Duration,
    pub max_context: u32,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081/v1".to_string(),
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            max_context: 4096,
            retry: RetryPolicy::default(),
        }
    }
}

/// [`LlmBackend`] implementation over an OpenAI-compatible HTTP API.
pub struct RemoteBackend {
    config: RemoteConfig,
    client: reqwest::Client,
    shut_down: AtomicBool,
}

impl RemoteBackend {
    pub fn new(mut config: RemoteConfig) -> Result<Arc<Self>, BackendError> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Internal(format!("http client: {e}")))?;
        Ok(Arc::new(Self {
            config,
            client,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Connectivity probe against `/models`. Failure is reported, not fatal.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.config.base_url);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(url = %url, error = %e, "remote health check failed");
                false
            }
        }
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::ModelUnavailable(
                "backend has been shut down".into(),
            ));
        }
        Ok(())
    }

    fn completion_body(&self, prompt: &str, params: &SamplingParams, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "top_k": params.top_k,
            "repeat_penalty": params.repeat_penalty,
            "stream": stream,
        });
        if !params.stop.is_empty() {
            body["stop"] = json!(params.stop);
        }
        if let Some(seed) = params.seed {
            body["seed"] = json!(seed);
        }
        body
    }

    fn chat_body(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": stream,
        });
        if !params.stop.is_empty() {
            body["stop"] = json!(params.stop);
        }
        if let Some(seed) = params.seed {
            body["seed"] = json!(seed);
        }
        body
    }

    /// POST with exponential-backoff retry on connect/timeout errors only.
    /// Returns the successful response and the attempt number that won.
    async fn post_with_retry(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(reqwest::Response, u32), BackendError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut backoff = self.config.retry.initial_backoff;
        let mut last_error = String::new();
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                debug!(url = %url, attempt, backoff_ms = backoff.as_millis() as u64, "retrying upstream request");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.config.retry.max_backoff);
            }

            let mut req = self.client.post(&url).json(body);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                r = req.send() => r,
            };

            match result {
                Ok(resp) if resp.status().is_success() => return Ok((resp, attempt)),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let message = resp.text().await.unwrap_or_default();
                    return Err(BackendError::UpstreamHttp {
                        status,
                        message: truncate(&message, 512),
                    });
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(url = %url, attempt, error = %e, "upstream transport error");
                    last_error = e.to_string();
                }
                Err(e) => {
                    return Err(BackendError::UpstreamIo {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(BackendError::UpstreamIo {
            attempts: max_attempts,
            message: last_error,
        })
    }

    async fn run_completion(
        &self,
        path: &str,
        body: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        self.check_available()?;
        let start = Instant::now();
        let (resp, attempts) = self.post_with_retry(path, &body, &cancel).await?;
        let body_fut = resp.json::<RemoteCompletion>();
        let parsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            r = body_fut => r.map_err(|e| BackendError::UpstreamIo {
                attempts,
                message: format!("invalid upstream body: {e}"),
            })?,
        };

        let choice = parsed.choices.into_iter().next();
        let text = choice
            .as_ref()
            .and_then(|c| {
                c.text
                    .clone()
                    .or_else(|| c.message.as_ref().and_then(|m| m.content.clone()))
            })
            .unwrap_or_default();
        let finish_reason = choice
            .and_then(|c| c.finish_reason)
            .map(|r| parse_finish_reason(&r))
            .unwrap_or(FinishReason::Stop);
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_else(|| {
                // Upstream omitted usage: approximate from the request text.
                let prompt_text = body
                    .get("prompt")
                    .and_then(|p| p.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| {
                        body.get("messages").map(|m| m.to_string()).unwrap_or_default()
                    });
                TokenUsage::new(approximate_tokens(&prompt_text), approximate_tokens(&text))
            });

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("attempts".to_string(), json!(attempts));
        Ok(GenerationResult {
            text,
            finish_reason,
            usage,
            elapsed_ms: start.elapsed().as_millis() as u64,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            metadata,
        })
    }

    async fn run_stream(
        &self,
        path: &str,
        body: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        self.check_available()?;
        let (resp, _attempts) = self.post_with_retry(path, &body, &cancel).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<GenerationChunk, BackendError>>(16);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut parser = SseParser::new();
            let mut usage_seen: Option<TokenUsage> = None;

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx
                            .send(Ok(GenerationChunk::finished(FinishReason::Cancelled, usage_seen)))
                            .await;
                        return;
                    }
                    item = bytes.next() => item,
                };

                match item {
                    Some(Ok(data)) => {
                        for event in parser.push(&data) {
                            match event {
                                SseEvent::Done => {
                                    let _ = tx
                                        .send(Ok(GenerationChunk::finished(
                                            FinishReason::Stop,
                                            usage_seen,
                                        )))
                                        .await;
                                    return;
                                }
                                SseEvent::Data(payload) => {
                                    let parsed: RemoteStreamChunk =
                                        match serde_json::from_str(&payload) {
                                            Ok(parsed) => parsed,
                                            Err(e) => {
                                                warn!(error = %e, "skipping unparseable SSE event");
                                                continue;
                                            }
                                        };
                                    if let Some(u) = parsed.usage {
                                        usage_seen = Some(TokenUsage {
                                            prompt_tokens: u.prompt_tokens,
                                            completion_tokens: u.completion_tokens,
                                            total_tokens: u.total_tokens,
                                        });
                                    }
                                    let Some(choice) = parsed.choices.into_iter().next() else {
                                        continue;
                                    };
                                    let delta = choice
                                        .text
                                        .or(choice.delta.and_then(|d| d.content))
                                        .unwrap_or_default();
                                    if !delta.is_empty()
                                        && tx.send(Ok(GenerationChunk::delta(delta))).await.is_err()
                                    {
                                        return;
                                    }
                                    if let Some(reason) = choice.finish_reason {
                                        let _ = tx
                                            .send(Ok(GenerationChunk::finished(
                                                parse_finish_reason(&reason),
                                                usage_seen,
                                            )))
                                            .await;
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(BackendError::UpstreamIo {
                                attempts: 1,
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                    None => {
                        // Upstream closed without [DONE].
                        let _ = tx
                            .send(Err(BackendError::UpstreamIo {
                                attempts: 1,
                                message: "upstream stream ended before [DONE]".into(),
                            }))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl LlmBackend for RemoteBackend {
    fn model_id(&self) -> String {
        self.config.model.clone()
    }

    fn max_context(&self) -> u32 {
        self.config.max_context
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        let body = self.completion_body(prompt, params, false);
        self.run_completion("/completions", body, cancel).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        let body = self.completion_body(prompt, params, true);
        self.run_stream("/completions", body, cancel).await
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        let body = self.chat_body(messages, params, false);
        self.run_completion("/chat/completions", body, cancel).await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        let body = self.chat_body(messages, params, true);
        self.run_stream("/chat/completions", body, cancel).await
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.check_available()?;
        let body = json!({ "model": self.config.model, "input": texts });
        let (resp, attempts) = self
            .post_with_retry("/embeddings", &body, &CancellationToken::new())
            .await?;
        let parsed: RemoteEmbeddings = resp.json().await.map_err(|e| BackendError::UpstreamIo {
            attempts,
            message: format!("invalid embeddings body: {e}"),
        })?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Remote tokenizers are unavailable; approximate one token per four
    /// characters.
    async fn count_tokens(&self, text: &str) -> u32 {
        approximate_tokens(text)
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

fn approximate_tokens(text: &str) -> u32 {
    (text.len() / 4 + 1) as u32
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "cancelled" => FinishReason::Cancelled,
        "error" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RemoteCompletion {
    #[serde(default)]
    choices: Vec<RemoteChoice>,
    usage: Option<RemoteUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteChoice {
    text: Option<String>,
    message: Option<RemoteMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct RemoteStreamChunk {
    #[serde(default)]
    choices: Vec<RemoteStreamChoice>,
    usage: Option<RemoteUsage>,
}

#[derive(Debug, Deserialize)]
struct RemoteStreamChoice {
    text: Option<String>,
    delta: Option<RemoteDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteEmbeddings {
    #[serde(default)]
    data: Vec<RemoteEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct RemoteEmbeddingData {
    embedding: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE line framing
// ─────────────────────────────────────────────────────────────────────────────

enum SseEvent {
    Data(String),
    Done,
}

/// Incremental SSE parser. Bytes arrive in arbitrary splits; only complete
/// `data: `-prefixed lines become events.
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload.trim() == "[DONE]" {
                events.push(SseEvent::Done);
            } else {
                events.push(SseEvent::Data(payload.to_string()));
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── SSE parser ───────────────────────────────────────────────────────

    fn data_payloads(events: Vec<SseEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|e| match e {
                SseEvent::Data(d) => Some(d),
                SseEvent::Done => Some("[DONE]".to_string()),
            })
            .collect()
    }

    #[test]
    fn test_sse_parses_complete_events() {
        let mut p = SseParser::new();
        let events = p.push(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(data_payloads(events), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn test_sse_reassembles_split_lines() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: {\"par").is_empty());
        let events = p.push(b"tial\":true}\n");
        assert_eq!(data_payloads(events), vec!["{\"partial\":true}"]);
    }

    #[test]
    fn test_sse_ignores_non_data_lines() {
        let mut p = SseParser::new();
        let events = p.push(b"event: ping\n: comment\nretry: 100\ndata: {\"x\":1}\n");
        assert_eq!(data_payloads(events), vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_sse_handles_crlf() {
        let mut p = SseParser::new();
        let events = p.push(b"data: one\r\ndata: [DONE]\r\n");
        assert_eq!(data_payloads(events), vec!["one", "[DONE]"]);
    }

    #[test]
    fn test_sse_requires_space_after_colon() {
        let mut p = SseParser::new();
        // Only `data: ` prefixed lines are events per the wire contract.
        let events = p.push(b"data:no-space\ndata: yes\n");
        assert_eq!(data_payloads(events), vec!["yes"]);
    }

    // ── helpers ──────────────────────────────────────────────────────────

    #[test]
    fn test_token_approximation() {
        assert_eq!(approximate_tokens(""), 1);
        assert_eq!(approximate_tokens("abcd"), 2);
        assert_eq!(approximate_tokens("a".repeat(40).as_str()), 11);
    }

    #[test]
    fn test_parse_finish_reason_mapping() {
        assert_eq!(parse_finish_reason("stop"), FinishReason::Stop);
        assert_eq!(parse_finish_reason("length"), FinishReason::Length);
        assert_eq!(parse_finish_reason("weird"), FinishReason::Stop);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let out = truncate(text, 3);
        assert!(out.ends_with('…'));
    }
}
