//! Server assembly and lifecycle.
//!
//! Start order: resolve config → optimizer pass (unless skipped) →
//! construct and preload the backend → build router → bind. The listener
//! is never bound before the model load succeeds. Stop order: stop
//! accepting, cancel the root token (which closes WS sessions and cancels
//! every in-flight backend call), drain within the grace period, shut the
//! backend down.

use crate::auth;
use crate::config::{BackendKind, ConfigError, ConfigHandle, GatewayConfig};
use crate::handlers::{chat, completions, config_api, models, status, ws};
use crate::state::{AppState, ConnectionTracker};
use axum::Router;
use axum::routing::{any, get, post};
use gencore_backend::{BackendError, LlmBackend, MockBackend, MockConfig, SamplingParams};
use gencore_cache::{CacheConfig, ResponseCache};
use gencore_hardware::{
    BenchRunner, BenchSample, Optimizer, ProfileStore, RuntimeParameters, StoreError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("profile store error: {0}")]
    Store(#[from] StoreError),

    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adapts the live backend contract to the optimizer's benchmark seam.
/// Owns its backend instance; `shutdown` releases it.
pub struct BackendBenchRunner {
    backend: Arc<dyn LlmBackend>,
}

impl BackendBenchRunner {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl BenchRunner for BackendBenchRunner {
    async fn run(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<BenchSample, String> {
        let params = SamplingParams {
            max_tokens,
            temperature,
            ..Default::default()
        };
        let result = self
            .backend
            .generate(prompt, &params, CancellationToken::new())
            .await
            .map_err(|e| e.to_string())?;
        Ok(BenchSample {
            tokens: result.usage.completion_tokens,
        })
    }

    async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}

fn default_profile_path() -> PathBuf {
    PathBuf::from("config").join("hardware_profile.json")
}

/// Run the optimizer per configuration and return the runtime parameters
/// the backend should load with. Never fatal: failures fall back to
/// defaults.
async fn resolve_runtime_parameters(config: &GatewayConfig) -> RuntimeParameters {
    if config.optimization.skip {
        info!("hardware optimization skipped by configuration");
        return RuntimeParameters::default();
    }
    let profile_path = config
        .optimization
        .profile_path
        .clone()
        .unwrap_or_else(default_profile_path);
    let force = config.optimization.force;
    let hint = config.optimization.model_vram_hint_mb;

    if force {
        // Full pass including a benchmark. A scratch mock instance serves
        // as the bench runner so the real serving backend is untouched.
        let optimizer = Optimizer::new(ProfileStore::new(profile_path));
        let runner = BackendBenchRunner::new(MockBackend::new(MockConfig::default()));
        match optimizer.run_full(Some(&runner), hint).await {
            Ok(report) => {
                info!(
                    tokens_per_second = format!("{:.1}", report.bench.tokens_per_second),
                    "forced optimization pass complete"
                );
                return report.profile.runtime;
            }
            Err(e) => {
                warn!(error = %e, "forced optimization failed, using defaults");
                return RuntimeParameters::default();
            }
        }
    }

    let result = tokio::task::spawn_blocking(move || {
        let optimizer = Optimizer::new(ProfileStore::new(profile_path));
        optimizer
            .ensure_profile(false)
            .map(|profile| optimizer.compute_runtime(&profile.hardware, hint))
    })
    .await;

    match result {
        Ok(Ok(runtime)) => runtime,
        Ok(Err(e)) => {
            warn!(error = %e, "optimizer failed, using default runtime parameters");
            RuntimeParameters::default()
        }
        Err(e) => {
            warn!(error = %e, "optimizer task panicked, using default runtime parameters");
            RuntimeParameters::default()
        }
    }
}

/// Apply explicitly pinned model parameters over the optimizer's output.
fn apply_pins(mut runtime: RuntimeParameters, config: &GatewayConfig) -> RuntimeParameters {
    if let Some(n_ctx) = config.model.n_ctx {
        runtime.context_size = n_ctx;
    }
    if let Some(n_batch) = config.model.n_batch {
        runtime.batch_size = n_batch;
    }
    if let Some(n_threads) = config.model.n_threads {
        runtime.n_threads = n_threads;
    }
    if let Some(n_gpu_layers) = config.model.n_gpu_layers {
        runtime.n_gpu_layers = n_gpu_layers;
    }
    runtime
}

async fn build_backend(
    config: &GatewayConfig,
    runtime: &RuntimeParameters,
) -> Result<Arc<dyn LlmBackend>, ServerError> {
    match config.backend.kind {
        BackendKind::Mock => {
            let model_id = config
                .model
                .path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "gencore-mock".to_string());
            Ok(MockBackend::new(MockConfig {
                model_id,
                max_context: runtime.context_size,
                ..Default::default()
            }))
        }
        BackendKind::Remote => {
            let remote = &config.backend.remote;
            let backend = gencore_backend::RemoteBackend::new(gencore_backend::RemoteConfig {
                base_url: remote.base_url.clone(),
                api_key: remote.api_key.clone(),
                model: remote.model.clone(),
                connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
                request_timeout: Duration::from_secs(remote.request_timeout_secs),
                max_context: runtime.context_size,
                retry: gencore_backend::RetryPolicy {
                    max_attempts: remote.max_attempts,
                    ..Default::default()
                },
            })?;
            // Connectivity probe; a degraded endpoint is reported but does
            // not block startup, since it may come up later.
            if !backend.health_check().await {
                warn!(base_url = %remote.base_url, "remote backend health check failed");
            }
            Ok(backend)
        }
        BackendKind::Native => build_native_backend(config, runtime),
    }
}

#[cfg(feature = "candle")]
fn build_native_backend(
    config: &GatewayConfig,
    runtime: &RuntimeParameters,
) -> Result<Arc<dyn LlmBackend>, ServerError> {
    let model_path = config.model.path.clone().ok_or_else(|| {
        ServerError::Backend(BackendError::ModelUnavailable("model.path not set".into()))
    })?;
    let tokenizer_path = config.model.tokenizer_path.clone().ok_or_else(|| {
        ServerError::Backend(BackendError::ModelUnavailable(
            "model.tokenizer_path must be set for the native backend".into(),
        ))
    })?;
    let backend = gencore_backend::NativeBackend::load(gencore_backend::NativeConfig {
        model_path,
        tokenizer_path,
        runtime: runtime.clone(),
        system_prompt: config.model.system_prompt.clone(),
        default_seed: config.model.seed.unwrap_or(42),
    })?;
    Ok(backend)
}

#[cfg(not(feature = "candle"))]
fn build_native_backend(
    _config: &GatewayConfig,
    _runtime: &RuntimeParameters,
) -> Result<Arc<dyn LlmBackend>, ServerError> {
    Err(ServerError::Backend(BackendError::ModelUnavailable(
        "this build does not include the native runtime (enable the `candle` feature)".into(),
    )))
}

/// Construct all singletons. The backend is loaded here, before any
/// listener exists.
pub async fn build_state(config: GatewayConfig) -> Result<AppState, ServerError> {
    config.validate()?;

    let runtime = apply_pins(resolve_runtime_parameters(&config).await, &config);
    info!(
        threads = runtime.n_threads,
        ctx = runtime.context_size,
        batch = runtime.batch_size,
        gpu_layers = runtime.n_gpu_layers,
        "runtime parameters resolved"
    );

    let backend = build_backend(&config, &runtime).await?;

    let cache = ResponseCache::new(CacheConfig {
        capacity: config.cache.capacity,
        ttl: Duration::from_secs(config.cache.ttl_secs),
        enabled: config.cache.enabled,
    });

    Ok(AppState {
        config: Arc::new(ConfigHandle::new(config)),
        backend,
        cache: Arc::new(cache),
        connections: Arc::new(ConnectionTracker::default()),
        shutdown: CancellationToken::new(),
        started_at: Instant::now(),
    })
}

/// Assemble the router with auth, tracing, and CORS layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(status::status))
        .route("/v1/models", get(models::list_models))
        .route("/v1/completions", post(completions::completions))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route(
            "/v1/config",
            get(config_api::get_config).post(config_api::update_config),
        )
        .route("/ws/completions", any(ws::ws_completions))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until a shutdown signal, then drain.
pub async fn serve(config: GatewayConfig) -> Result<(), ServerError> {
    let state = build_state(config).await?;
    let snapshot = state.config.snapshot();
    let app = build_router(state.clone());

    let addr = format!("{}:{}", snapshot.server.host, snapshot.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        model = %state.backend.model_id(),
        auth_enabled = !snapshot.auth.api_keys.is_empty(),
        "GenCore gateway listening"
    );
    if snapshot.auth.api_keys.is_empty() {
        warn!("auth.api_keys is empty — authentication is DISABLED");
    }

    // Signal handler: first signal starts the graceful stop.
    {
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let graceful = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    // Drain: in-flight requests were cancelled via the root token; give
    // them the configured grace period to unwind.
    let deadline = Instant::now() + Duration::from_secs(snapshot.server.drain_grace_secs);
    while state.connections.active_requests() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let leftover = state.connections.active_requests();
    if leftover > 0 {
        warn!(leftover, "drain grace expired with requests still active");
    }

    state.backend.shutdown().await;
    info!("gateway stopped");
    Ok(())
}
