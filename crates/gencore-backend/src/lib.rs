//! LLM backend abstraction for the GenCore gateway.
//!
//! [`LlmBackend`] is the uniform contract the gateway talks to. Three
//! implementations live here:
//!
//! - [`mock::MockBackend`] — deterministic in-process token source used in
//!   default builds, tests, and mock benchmarks.
//! - [`remote::RemoteBackend`] — drives any OpenAI-compatible HTTP endpoint
//!   with connection pooling, bounded retry, and SSE streaming.
//! - `native::NativeBackend` (feature `candle`) — in-process quantized GGUF
//!   runtime behind an exclusive lock.
//!
//! All generation paths accept a `CancellationToken`; streams observe a
//! fired token within a handful of produced tokens and terminate with
//! `finish_reason = cancelled`.

pub mod mock;
#[cfg(feature = "candle")]
pub mod native;
pub mod remote;
pub mod traits;
pub mod types;

pub use mock::{MockBackend, MockConfig};
#[cfg(feature = "candle")]
pub use native::{NativeBackend, NativeConfig};
pub use remote::{RemoteBackend, RemoteConfig, RetryPolicy};
pub use traits::{GenerationStream, LlmBackend};
pub use types::{
    BackendError, ChatMessage, FinishReason, GenerationChunk, GenerationResult, Role,
    SamplingParams, TokenUsage, render_chat_prompt,
};
