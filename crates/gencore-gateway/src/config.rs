//! Gateway configuration.
//!
//! One JSON document, resolved in layers: built-in defaults ← config file ←
//! `GC_MODEL_PATH` environment override ← CLI flags. Handlers never touch a
//! mutable config: they read an immutable snapshot through [`ConfigHandle`],
//! and the config-update endpoint publishes a whole new snapshot after
//! validation.
//!
//! This struct is the authoritative schema for `POST /v1/config`: the merge
//! deserializes with `deny_unknown_fields`, so unknown keys are rejected
//! rather than silently dropped.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which backend implementation serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process GGUF runtime (requires the `candle` build feature).
    Native,
    /// OpenAI-compatible HTTP endpoint.
    Remote,
    /// Deterministic in-process mock.
    #[default]
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Per-request wall-clock budget.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight requests to drain.
    pub drain_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 120,
            drain_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub path: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,
    /// Explicit values pin the optimizer's outputs.
    pub n_ctx: Option<u32>,
    pub n_batch: Option<u32>,
    pub n_threads: Option<u32>,
    pub n_gpu_layers: Option<u32>,
    pub seed: Option<u64>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081/v1".to_string(),
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    pub kind: BackendKind,
    pub remote: RemoteSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
    /// Trim trailing prompt whitespace before fingerprinting.
    pub canonicalize_whitespace: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_secs: 600,
            canonicalize_whitespace: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    /// Empty list disables authentication entirely.
    pub api_keys: Vec<String>,
    /// Serve `GET /v1/models` without a key even when auth is on.
    pub allow_unauthenticated_models: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            allow_unauthenticated_models: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizationSection {
    pub skip: bool,
    pub force: bool,
    pub profile_path: Option<PathBuf>,
    /// Approximate model VRAM requirement, feeds GPU-layer selection.
    pub model_vram_hint_mb: Option<u64>,
}

/// The complete gateway configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub server: ServerSection,
    pub model: ModelSection,
    pub backend: BackendSection,
    pub cache: CacheSection,
    pub auth: AuthSection,
    pub optimization: OptimizationSection,
}

impl GatewayConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. `GC_MODEL_PATH` replaces the model path
    /// when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("GC_MODEL_PATH") {
            if !path.trim().is_empty() {
                tracing::info!(path = %path, "model path overridden by GC_MODEL_PATH");
                self.model.path = Some(PathBuf::from(path));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.request_timeout_secs must be positive".into(),
            ));
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.ttl_secs must be positive when the cache is enabled".into(),
            ));
        }
        if self.backend.kind == BackendKind::Remote && self.backend.remote.base_url.is_empty() {
            return Err(ConfigError::Invalid(
                "backend.remote.base_url must be set for the remote backend".into(),
            ));
        }
        if self.backend.kind == BackendKind::Native && self.model.path.is_none() {
            return Err(ConfigError::Invalid(
                "model.path must be set for the native backend".into(),
            ));
        }
        Ok(())
    }

    /// Redacted view for `GET /v1/config`: secrets never leave the process.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(keys) = value
            .pointer_mut("/auth/api_keys")
            .and_then(|v| v.as_array_mut())
        {
            for key in keys.iter_mut() {
                *key = serde_json::Value::String("***".to_string());
            }
        }
        if let Some(key) = value.pointer_mut("/backend/remote/api_key") {
            if !key.is_null() {
                *key = serde_json::Value::String("***".to_string());
            }
        }
        value
    }

    /// Merge a JSON patch into a copy of this config. Returns the merged
    /// config and whether applying it requires a model reload (any change
    /// under `model` or `backend`).
    pub fn merge_update(
        &self,
        patch: &serde_json::Value,
    ) -> Result<(GatewayConfig, bool), ConfigError> {
        if !patch.is_object() {
            return Err(ConfigError::Invalid(
                "config update must be a JSON object".into(),
            ));
        }
        let mut merged = serde_json::to_value(self)?;
        deep_merge(&mut merged, patch);
        let updated: GatewayConfig = serde_json::from_value(merged)?;
        updated.validate()?;

        let reload_required =
            updated.model != self.model || updated.backend != self.backend;
        Ok((updated, reload_required))
    }
}

fn deep_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Readable-by-many snapshot holder. Mutation publishes a new `Arc`.
pub struct ConfigHandle {
    inner: RwLock<Arc<GatewayConfig>>,
}

impl ConfigHandle {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.inner.read().clone()
    }

    pub fn replace(&self, config: GatewayConfig) {
        *self.inner.write() = Arc::new(config);
    }
}
