//! OpenAI-compatible wire types: request validation and response envelopes.

use crate::error::ApiError;
use gencore_backend::{ChatMessage, FinishReason, Role, SamplingParams, TokenUsage};
use gencore_cache::SamplingKey;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// `POST /v1/completions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// Shared sampling fields extracted from either request shape.
#[derive(Debug, Clone, Default)]
struct SamplingFields {
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    repeat_penalty: Option<f32>,
    stop: Option<Vec<String>>,
    seed: Option<u64>,
}

fn validate_sampling(fields: SamplingFields) -> Result<SamplingParams, ApiError> {
    let defaults = SamplingParams::default();

    let max_tokens = fields.max_tokens.unwrap_or(defaults.max_tokens);
    if !(1..=4096).contains(&max_tokens) {
        return Err(ApiError::Validation(
            "max_tokens must be between 1 and 4096".into(),
        ));
    }
    let temperature = fields.temperature.unwrap_or(defaults.temperature);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ApiError::Validation(
            "temperature must be between 0.0 and 2.0".into(),
        ));
    }
    let top_p = fields.top_p.unwrap_or(defaults.top_p);
    if !(0.0..=1.0).contains(&top_p) {
        return Err(ApiError::Validation("top_p must be between 0.0 and 1.0".into()));
    }
    let repeat_penalty = fields.repeat_penalty.unwrap_or(defaults.repeat_penalty);
    if repeat_penalty < 0.0 {
        return Err(ApiError::Validation("repeat_penalty must be >= 0".into()));
    }

    Ok(SamplingParams {
        max_tokens,
        temperature,
        top_p,
        top_k: fields.top_k.unwrap_or(defaults.top_k),
        repeat_penalty,
        stop: fields.stop.unwrap_or_default(),
        seed: fields.seed,
    })
}

impl CompletionRequest {
    /// Validate and normalize. Returns the sampling parameters and whether
    /// the client requested streaming.
    pub fn validate(&self) -> Result<(SamplingParams, bool), ApiError> {
        if self.prompt.is_empty() {
            return Err(ApiError::Validation("prompt must not be empty".into()));
        }
        let params = validate_sampling(SamplingFields {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            stop: self.stop.clone(),
            seed: self.seed,
        })?;
        Ok((params, self.stream.unwrap_or(false)))
    }
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<(Vec<ChatMessage>, SamplingParams, bool), ApiError> {
        if self.messages.is_empty() {
            return Err(ApiError::Validation("messages must not be empty".into()));
        }
        let mut messages = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            let role = match msg.role.as_str() {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                other => {
                    return Err(ApiError::Validation(format!("unknown role '{other}'")));
                }
            };
            messages.push(ChatMessage {
                role,
                content: msg.content.clone(),
            });
        }
        let params = validate_sampling(SamplingFields {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            stop: self.stop.clone(),
            seed: self.seed,
        })?;
        Ok((messages, params, self.stream.unwrap_or(false)))
    }
}

/// Fingerprint key view of validated sampling parameters. Defaults are
/// already materialized, so unset and explicitly-default requests collapse
/// to the same key.
pub fn sampling_key(params: &SamplingParams) -> SamplingKey {
    SamplingKey {
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        repeat_penalty: params.repeat_penalty,
        stop: params.stop.clone(),
        seed: params.seed,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response envelopes
// ─────────────────────────────────────────────────────────────────────────────

pub fn new_completion_id() -> String {
    format!("cmpl-{}", Uuid::new_v4().simple())
}

pub fn new_chat_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn completion_response(
    id: &str,
    model: &str,
    text: &str,
    finish: FinishReason,
    usage: TokenUsage,
) -> Value {
    json!({
        "id": id,
        "object": "text_completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "text": text,
            "index": 0,
            "logprobs": null,
            "finish_reason": finish.as_str(),
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        },
    })
}

pub fn chat_response(
    id: &str,
    model: &str,
    content: &str,
    finish: FinishReason,
    usage: TokenUsage,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish.as_str(),
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        },
    })
}

/// One SSE frame of a streaming completion.
pub fn completion_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: &str,
    finish: Option<FinishReason>,
) -> Value {
    json!({
        "id": id,
        "object": "text_completion",
        "created": created,
        "model": model,
        "choices": [{
            "text": delta,
            "index": 0,
            "logprobs": null,
            "finish_reason": finish.map(|f| f.as_str()),
        }],
    })
}

/// One SSE frame of a streaming chat completion. The first frame carries
/// the assistant role marker.
pub fn chat_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: &str,
    first: bool,
    finish: Option<FinishReason>,
) -> Value {
    let mut delta_obj = serde_json::Map::new();
    if first {
        delta_obj.insert("role".into(), json!("assistant"));
    }
    if !delta.is_empty() {
        delta_obj.insert("content".into(), json!(delta));
    }
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta_obj,
            "finish_reason": finish.map(|f| f.as_str()),
        }],
    })
}

/// Usage block attached to the terminal stream frame.
pub fn usage_value(usage: TokenUsage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(body: Value) -> Result<CompletionRequest, serde_json::Error> {
        serde_json::from_value(body)
    }

    #[test]
    fn test_defaults_applied() {
        let req = completion(json!({"prompt": "hi"})).unwrap();
        let (params, stream) = req.validate().unwrap();
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_p, 0.95);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.repeat_penalty, 1.1);
        assert!(params.stop.is_empty());
        assert!(!stream);
    }

    #[test]
    fn test_missing_prompt_fails_to_parse() {
        assert!(completion(json!({"max_tokens": 4})).is_err());
    }

    #[test]
    fn test_range_validation() {
        for body in [
            json!({"prompt": "x", "max_tokens": 0}),
            json!({"prompt": "x", "max_tokens": 5000}),
            json!({"prompt": "x", "temperature": 2.5}),
            json!({"prompt": "x", "top_p": 1.5}),
            json!({"prompt": "x", "repeat_penalty": -0.1}),
        ] {
            let req = completion(body.clone()).unwrap();
            assert!(req.validate().is_err(), "must reject {body}");
        }
    }

    #[test]
    fn test_unset_and_default_produce_equal_keys() {
        let implicit = completion(json!({"prompt": "x"})).unwrap();
        let explicit = completion(json!({
            "prompt": "x",
            "max_tokens": 256,
            "temperature": 0.7,
            "top_p": 0.95,
            "top_k": 40,
            "repeat_penalty": 1.1,
            "stop": [],
        }))
        .unwrap();
        let (a, _) = implicit.validate().unwrap();
        let (b, _) = explicit.validate().unwrap();
        assert_eq!(sampling_key(&a), sampling_key(&b));
    }

    #[test]
    fn test_chat_role_validation() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "wizard", "content": "hi"}],
        }))
        .unwrap();
        assert!(req.validate().is_err());

        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        let (messages, _, _) = req.validate().unwrap();
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn test_empty_messages_rejected() {
        let req: ChatCompletionRequest =
            serde_json::from_value(json!({"messages": []})).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_completion_envelope_shape() {
        let body = completion_response(
            "cmpl-1",
            "m",
            "hello",
            FinishReason::Stop,
            TokenUsage::new(2, 3),
        );
        assert_eq!(body["object"], "text_completion");
        assert_eq!(body["choices"][0]["text"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }

    #[test]
    fn test_chat_chunk_role_only_on_first() {
        let first = chat_chunk("id", 0, "m", "hi", true, None);
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        let later = chat_chunk("id", 0, "m", "there", false, None);
        assert!(later["choices"][0]["delta"].get("role").is_none());
        let terminal = chat_chunk("id", 0, "m", "", false, Some(FinishReason::Stop));
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    }
}
