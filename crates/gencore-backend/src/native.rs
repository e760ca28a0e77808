//! Native in-process backend over a quantized GGUF model.
//!
//! Wraps the Candle quantized-llama runtime. The model context is not safe
//! for concurrent calls, so all access is serialised through one async
//! mutex; requests queue for the handle. The sampling loop runs on a
//! blocking thread and feeds chunks to the async side over a channel, one
//! chunk per produced token, checking the cancellation token at every
//! step.
//!
//! The quantized loader exposes no embedding head, so `embed` reports
//! `NotSupported` regardless of configuration.

use crate::traits::{GenerationStream, LlmBackend};
use crate::types::{
    BackendError, ChatMessage, FinishReason, GenerationChunk, GenerationResult, SamplingParams,
    TokenUsage, render_chat_prompt,
};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use futures::StreamExt;
use gencore_hardware::RuntimeParameters;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokenizers::Tokenizer;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Repeat-penalty window over the most recent tokens.
const REPEAT_LAST_N: usize = 64;

/// Native backend configuration. Runtime parameters normally come from the
/// optimizer; explicit config values pin them.
#[derive(Debug, Clone)]
pub struct NativeConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub runtime: RuntimeParameters,
    pub system_prompt: Option<String>,
    /// Seed used when a request does not carry one.
    pub default_seed: u64,
}

/// In-process GGUF runtime behind the [`LlmBackend`] contract.
pub struct NativeBackend {
    config: NativeConfig,
    model_id: String,
    device: Device,
    tokenizer: Tokenizer,
    eos_token_id: u32,
    weights: Arc<tokio::sync::Mutex<ModelWeights>>,
    shut_down: AtomicBool,
}

impl NativeBackend {
    /// Load the model and tokenizer. Any failure here is fatal to startup:
    /// the gateway must not bind its listener without a working model.
    pub fn load(config: NativeConfig) -> Result<Arc<Self>, BackendError> {
        let device = select_device(config.runtime.n_gpu_layers);
        info!(
            model = %config.model_path.display(),
            device = ?device,
            threads = config.runtime.n_threads,
            gpu_layers = config.runtime.n_gpu_layers,
            ctx = config.runtime.context_size,
            "loading GGUF model"
        );

        let mut file = std::fs::File::open(&config.model_path).map_err(|e| {
            BackendError::ModelUnavailable(format!(
                "cannot open {}: {e}",
                config.model_path.display()
            ))
        })?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| BackendError::ModelUnavailable(format!("invalid GGUF: {e}")))?;
        let weights = ModelWeights::from_gguf(content, &mut file, &device)
            .map_err(|e| BackendError::ModelUnavailable(format!("model load failed: {e}")))?;

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path).map_err(|e| {
            BackendError::ModelUnavailable(format!(
                "cannot load tokenizer {}: {e}",
                config.tokenizer_path.display()
            ))
        })?;
        let eos_token_id = tokenizer
            .token_to_id("</s>")
            .or_else(|| tokenizer.token_to_id("<|im_end|>"))
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .unwrap_or(2);

        let model_id = config
            .model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown.gguf".to_string());

        info!(model_id = %model_id, eos = eos_token_id, "native backend ready");
        Ok(Arc::new(Self {
            model_id,
            device,
            tokenizer,
            eos_token_id,
            weights: Arc::new(tokio::sync::Mutex::new(weights)),
            config,
            shut_down: AtomicBool::new(false),
        }))
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::ModelUnavailable(
                "backend has been shut down".into(),
            ));
        }
        Ok(())
    }

    /// Run the token loop on a blocking thread, pushing one chunk per token
    /// into `tx`. Holds the model guard for the whole generation.
    fn spawn_generation(
        &self,
        prompt: String,
        params: SamplingParams,
        cancel: CancellationToken,
        tx: tokio::sync::mpsc::Sender<Result<GenerationChunk, BackendError>>,
    ) {
        let weights = self.weights.clone();
        let tokenizer = self.tokenizer.clone();
        let device = self.device.clone();
        let eos = self.eos_token_id;
        let n_ctx = self.config.runtime.context_size as usize;
        let seed = params.seed.unwrap_or(self.config.default_seed);

        tokio::spawn(async move {
            let mut guard = weights.lock_owned().await;
            let result = tokio::task::spawn_blocking(move || {
                run_token_loop(
                    &mut guard, &tokenizer, &device, eos, n_ctx, seed, &prompt, &params, &cancel,
                    &tx,
                )
            })
            .await;
            if let Err(e) = result {
                debug!(error = %e, "generation task aborted");
            }
        });
    }
}

/// The blocking sampling loop. Errors are delivered through `tx` as a
/// terminal `Err` item.
#[allow(clippy::too_many_arguments)]
fn run_token_loop(
    model: &mut ModelWeights,
    tokenizer: &Tokenizer,
    device: &Device,
    eos_token_id: u32,
    n_ctx: usize,
    seed: u64,
    prompt: &str,
    params: &SamplingParams,
    cancel: &CancellationToken,
    tx: &tokio::sync::mpsc::Sender<Result<GenerationChunk, BackendError>>,
) {
    macro_rules! send_or_return {
        ($item:expr) => {
            if tx.blocking_send($item).is_err() {
                return;
            }
        };
    }
    macro_rules! fail {
        ($msg:expr) => {{
            send_or_return!(Err(BackendError::Internal($msg)));
            return;
        }};
    }

    let encoding = match tokenizer.encode(prompt, false) {
        Ok(encoding) => encoding,
        Err(e) => fail!(format!("tokenization failed: {e}")),
    };
    let prompt_tokens: Vec<u32> = encoding.get_ids().to_vec();
    let prompt_len = prompt_tokens.len();
    if prompt_len >= n_ctx {
        send_or_return!(Err(BackendError::InvalidRequest(format!(
            "prompt of {prompt_len} tokens exceeds the {n_ctx}-token context"
        ))));
        return;
    }
    // Clamp the output budget to what the context can still hold.
    let budget = (n_ctx - prompt_len).max(1);
    let max_tokens = (params.max_tokens as usize).min(budget);

    let sampling = if params.temperature <= 0.01 {
        Sampling::ArgMax
    } else {
        Sampling::TopKThenTopP {
            k: params.top_k.max(1) as usize,
            p: params.top_p as f64,
            temperature: params.temperature as f64,
        }
    };
    let mut processor = LogitsProcessor::from_sampling(seed, sampling);

    // Prefill.
    let input = match Tensor::new(prompt_tokens.as_slice(), device).and_then(|t| t.unsqueeze(0)) {
        Ok(input) => input,
        Err(e) => fail!(format!("prompt tensor: {e}")),
    };
    let logits = match model.forward(&input, 0).and_then(|l| l.squeeze(0)) {
        Ok(logits) => logits,
        Err(e) => fail!(format!("prefill failed: {e}")),
    };
    let mut next_token = match processor.sample(&logits) {
        Ok(token) => token,
        Err(e) => fail!(format!("sampling failed: {e}")),
    };

    let mut all_tokens: Vec<u32> = Vec::with_capacity(max_tokens);
    let mut emitted = String::new();
    let mut finish = FinishReason::Length;
    let mut pos = prompt_len;

    for produced in 0..max_tokens {
        if cancel.is_cancelled() {
            finish = FinishReason::Cancelled;
            break;
        }
        if next_token == eos_token_id {
            finish = FinishReason::Stop;
            break;
        }
        all_tokens.push(next_token);

        // Decode the whole sequence and emit the fresh suffix; incremental
        // per-token decoding mangles multi-byte BPE pieces.
        // TODO: hold back a partial stop-sequence suffix instead of emitting
        // it and truncating on the next decode.
        let decoded = match tokenizer.decode(&all_tokens, true) {
            Ok(decoded) => decoded,
            Err(e) => fail!(format!("decode failed: {e}")),
        };
        if let Some(cut) = params
            .stop
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| decoded.find(s.as_str()))
            .min()
        {
            let final_text = &decoded[..cut];
            if final_text.len() > emitted.len() {
                send_or_return!(Ok(GenerationChunk::delta(&final_text[emitted.len()..])));
            }
            emitted = final_text.to_string();
            finish = FinishReason::Stop;
            break;
        }
        if decoded.len() > emitted.len() {
            send_or_return!(Ok(GenerationChunk::delta(&decoded[emitted.len()..])));
            emitted = decoded;
        }

        if produced + 1 >= max_tokens {
            finish = FinishReason::Length;
            break;
        }

        let input = match Tensor::new(&[next_token], device).and_then(|t| t.unsqueeze(0)) {
            Ok(input) => input,
            Err(e) => fail!(format!("token tensor: {e}")),
        };
        let logits = match model.forward(&input, pos).and_then(|l| l.squeeze(0)) {
            Ok(logits) => logits,
            Err(e) => fail!(format!("forward failed at pos {pos}: {e}")),
        };
        let logits = if params.repeat_penalty > 1.0 {
            let start = all_tokens.len().saturating_sub(REPEAT_LAST_N);
            match candle_transformers::utils::apply_repeat_penalty(
                &logits,
                params.repeat_penalty,
                &all_tokens[start..],
            ) {
                Ok(logits) => logits,
                Err(e) => fail!(format!("repeat penalty: {e}")),
            }
        } else {
            logits
        };
        next_token = match processor.sample(&logits) {
            Ok(token) => token,
            Err(e) => fail!(format!("sampling failed: {e}")),
        };
        pos += 1;
    }

    let usage = TokenUsage::new(prompt_len as u32, all_tokens.len() as u32);
    let _ = tx.blocking_send(Ok(GenerationChunk::finished(finish, Some(usage))));
}

fn select_device(n_gpu_layers: u32) -> Device {
    if n_gpu_layers == 0 {
        return Device::Cpu;
    }
    match Device::new_cuda(0) {
        Ok(device) => device,
        Err(_) => match Device::new_metal(0) {
            Ok(device) => device,
            Err(_) => Device::Cpu,
        },
    }
}

#[async_trait]
impl LlmBackend for NativeBackend {
    fn model_id(&self) -> String {
        self.model_id.clone()
    }

    fn max_context(&self) -> u32 {
        self.config.runtime.context_size
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        let start = Instant::now();
        let mut stream = self.generate_stream(prompt, params, cancel).await?;

        let mut text = String::new();
        let mut finish = FinishReason::Stop;
        let mut usage = TokenUsage::default();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            text.push_str(&chunk.delta);
            if let Some(reason) = chunk.finish_reason {
                finish = reason;
                if let Some(u) = chunk.usage {
                    usage = u;
                }
            }
        }
        Ok(GenerationResult {
            text,
            finish_reason: finish,
            usage,
            elapsed_ms: start.elapsed().as_millis() as u64,
            model: self.model_id.clone(),
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
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        self.spawn_generation(prompt.to_string(), params.clone(), cancel, tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, BackendError> {
        let prompt = render_chat_prompt(messages, self.config.system_prompt.as_deref());
        self.generate(&prompt, params, cancel).await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        let prompt = render_chat_prompt(messages, self.config.system_prompt.as_deref());
        self.generate_stream(&prompt, params, cancel).await
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        // The quantized loader has no embedding head to run.
        Err(BackendError::NotSupported(
            "quantized GGUF runtime was not loaded with embedding capability".into(),
        ))
    }

    async fn count_tokens(&self, text: &str) -> u32 {
        self.tokenizer
            .encode(text, false)
            .map(|e| e.get_ids().len() as u32)
            .unwrap_or_else(|_| (text.len() / 4 + 1) as u32)
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        info!(model_id = %self.model_id, "native backend shut down");
    }
}
