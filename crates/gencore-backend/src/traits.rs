//! The uniform backend contract.

use crate::types::{
    BackendError, ChatMessage, GenerationChunk, GenerationResult, SamplingParams,
    render_chat_prompt,
};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Finite, non-restartable stream of generation chunks. The last `Ok` item
/// carries a non-empty `finish_reason`, or the stream ends with a single
/// `Err`; either way nothing follows the terminal element.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationChunk, BackendError>> + Send>>;

/// Contract satisfied by every token producer (native runtime, remote
/// endpoint, mock).
///
/// # Cancellation
///
/// Every generation call receives a [`CancellationToken`]. A fired token is
/// observed within a bounded number of produced tokens (at most 8; the
/// bundled implementations check on every token) and the call finishes with
/// `finish_reason = cancelled` — streams via their terminal chunk,
/// synchronous calls via the returned result.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend-reported model identifier.
    fn model_id(&self) -> String;

    /// Maximum context window in tokens (prompt + generated).
    fn max_context(&self) -> u32;

    async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError>;

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError>;

    /// Chat with message history. The default renders messages through the
    /// ChatML-style template and delegates to [`generate`](Self::generate);
    /// backends with a real chat endpoint override this.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        let prompt = render_chat_prompt(messages, None);
        self.generate(&prompt, params, cancel).await
    }

    /// Streaming chat; same default strategy as [`chat`](Self::chat).
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        let prompt = render_chat_prompt(messages, None);
        self.generate_stream(&prompt, params, cancel).await
    }

    /// Embed a batch of texts. Optional capability.
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Err(BackendError::NotSupported(format!(
            "backend {} does not support embeddings",
            self.model_id()
        )))
    }

    /// Best-effort token count; remote backends approximate.
    async fn count_tokens(&self, text: &str) -> u32;

    /// Release backend resources. Idempotent.
    async fn shutdown(&self);
}
