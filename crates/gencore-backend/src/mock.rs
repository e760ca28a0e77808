//! Deterministic in-process backend.
//!
//! Stands in for the native runtime in default builds and tests: given the
//! same prompt and sampling parameters it always produces the same token
//! stream, honours `max_tokens`, stop sequences, and cancellation exactly
//! like the real adapters, and can be scripted to fail the next N
//! generations for retry and single-flight tests.

use crate::traits::{GenerationStream, LlmBackend};
use crate::types::{
    BackendError, FinishReason, GenerationChunk, GenerationResult, SamplingParams, TokenUsage,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const WORDS: &[&str] = &[
    "the", "model", "generates", "tokens", "locally", "with", "bounded", "latency", "and",
    "deterministic", "sampling", "for", "repeatable", "tests", "under", "load",
];

/// Mock backend configuration.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub model_id: String,
    pub max_context: u32,
    /// Artificial delay per produced token; zero for unit tests, a few
    /// milliseconds when exercising cancellation latency.
    pub token_delay: Duration,
    pub supports_embedding: bool,
    /// Fail this many generations with an upstream-io error before
    /// succeeding. Drives retry tests.
    pub fail_generations: usize,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            model_id: "gencore-mock".to_string(),
            max_context: 4096,
            token_delay: Duration::ZERO,
            supports_embedding: true,
            fail_generations: 0,
        }
    }
}

/// Deterministic token source implementing [`LlmBackend`].
pub struct MockBackend {
    config: MockConfig,
    fail_remaining: AtomicUsize,
    generation_calls: AtomicUsize,
    shut_down: AtomicBool,
}

impl MockBackend {
    pub fn new(config: MockConfig) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(config.fail_generations),
            config,
            generation_calls: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Number of generation calls that reached token production.
    pub fn generation_calls(&self) -> usize {
        self.generation_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::ModelUnavailable(
                "backend has been shut down".into(),
            ));
        }
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::UpstreamIo {
                attempts: 1,
                message: "scripted failure".into(),
            });
        }
        Ok(())
    }

    /// Plan the full token sequence for a request. Pure and deterministic.
    fn plan(&self, prompt: &str, params: &SamplingParams) -> TokenPlan {
        let prompt_tokens = approximate_tokens(prompt);
        let budget = self
            .config
            .max_context
            .saturating_sub(prompt_tokens)
            .max(1);
        let effective_max = params.max_tokens.min(budget);

        let base = hash64(&[prompt.as_bytes(), &params.seed.unwrap_or(0).to_le_bytes()]);
        let natural_len = 12 + (base % 21) as u32;

        let mut tokens: Vec<String> = Vec::new();
        let mut text = String::new();
        let mut finish = FinishReason::Stop;

        for i in 0..effective_max.max(1) {
            let word = WORDS[(hash64(&[&base.to_le_bytes(), &i.to_le_bytes()]) as usize)
                % WORDS.len()];
            let piece = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            text.push_str(&piece);
            tokens.push(piece);

            if let Some(cut) = params
                .stop
                .iter()
                .filter(|s| !s.is_empty())
                .filter_map(|s| text.find(s.as_str()))
                .min()
            {
                text.truncate(cut);
                finish = FinishReason::Stop;
                break;
            }
            if i + 1 >= natural_len {
                finish = FinishReason::Stop;
                break;
            }
            if i + 1 >= effective_max {
                finish = FinishReason::Length;
                break;
            }
        }

        TokenPlan {
            tokens,
            text,
            finish,
            prompt_tokens,
        }
    }
}

struct TokenPlan {
    tokens: Vec<String>,
    text: String,
    finish: FinishReason,
    prompt_tokens: u32,
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn model_id(&self) -> String {
        self.config.model_id.clone()
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
        self.check_available()?;
        self.generation_calls.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let plan = self.plan(prompt, params);

        let mut produced = 0u32;
        let mut finish = plan.finish;
        for _ in &plan.tokens {
            if cancel.is_cancelled() {
                finish = FinishReason::Cancelled;
                break;
            }
            if !self.config.token_delay.is_zero() {
                tokio::time::sleep(self.config.token_delay).await;
            }
            produced += 1;
        }

        let text = if finish == FinishReason::Cancelled {
            plan.tokens[..produced as usize].concat()
        } else {
            plan.text
        };
        debug!(tokens = produced, finish = %finish, "mock generation complete");
        Ok(GenerationResult {
            usage: TokenUsage::new(plan.prompt_tokens, produced),
            text,
            finish_reason: finish,
            elapsed_ms: start.elapsed().as_millis() as u64,
            model: self.config.model_id.clone(),
            metadata: Default::default(),
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        self.check_available()?;
        self.generation_calls.fetch_add(1, Ordering::SeqCst);
        let plan = self.plan(prompt, params);
        let delay = self.config.token_delay;
        let model = self.config.model_id.clone();

        let (tx, rx) = tokio::sync::mpsc::channel::<GenerationChunk>(16);
        tokio::spawn(async move {
            let mut produced = 0u32;
            let mut finish = plan.finish;
            for piece in &plan.tokens {
                if cancel.is_cancelled() {
                    finish = FinishReason::Cancelled;
                    break;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                produced += 1;
                if tx.send(GenerationChunk::delta(piece.clone())).await.is_err() {
                    // Receiver dropped; still emit nothing further.
                    return;
                }
            }
            let usage = TokenUsage::new(plan.prompt_tokens, produced);
            let _ = tx.send(GenerationChunk::finished(finish, Some(usage))).await;
            debug!(model = %model, tokens = produced, finish = %finish, "mock stream complete");
        });

        Ok(Box::pin(ReceiverStream::new(rx).map(Ok)))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.check_available()?;
        if !self.config.supports_embedding {
            return Err(BackendError::NotSupported(
                "mock backend built without embedding support".into(),
            ));
        }
        Ok(texts.iter().map(|t| hash_embedding(t)).collect())
    }

    async fn count_tokens(&self, text: &str) -> u32 {
        approximate_tokens(text)
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

fn approximate_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn hash64(parts: &[&[u8]]) -> u64 {
    // FNV-1a; stability across runs matters, cryptographic strength does not.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in *part {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector: Vec<f32> = (0..8)
        .map(|i| {
            let h = hash64(&[text.as_bytes(), &[i]]);
            (h % 2000) as f32 / 1000.0 - 1.0
        })
        .collect();
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
