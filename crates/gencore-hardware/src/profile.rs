//! Persisted hardware and optimization data model.
//!
//! The on-disk document is [`OptimizationProfile`]: a schema-versioned JSON
//! object holding the probed [`HardwareProfile`], the derived
//! [`RuntimeParameters`], and a bounded history of [`BenchmarkRecord`]s.
//! Unknown JSON fields are captured in flattened `extra` maps so they
//! survive a load/save round-trip. [`CompilationFlags`] are recomputed from
//! the hardware profile on demand and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Benchmark records kept in the profile document.
pub const MAX_BENCHMARK_HISTORY: usize = 16;

/// GPU vendor detected on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    #[default]
    None,
    Nvidia,
    Amd,
    Intel,
    AppleSilicon,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::None => write!(f, "none"),
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::AppleSilicon => write!(f, "Apple Silicon"),
        }
    }
}

/// x86 SIMD extensions relevant to the native runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuFeatures {
    pub avx: bool,
    pub avx2: bool,
    pub avx512: bool,
    pub f16c: bool,
    pub fma: bool,
}

/// Acceleration API availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccelSupport {
    pub cuda: bool,
    pub rocm: bool,
    pub metal: bool,
    pub vulkan: bool,
    pub opencl: bool,
}

/// How a field group in the profile was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeSource {
    /// Read from the OS or a vendor tool.
    Probed,
    /// Derived from the CPU identity string because direct probing
    /// returned nothing.
    Fallback,
    /// Probing failed; the field holds its sentinel value.
    Unknown,
}

/// Descriptor of the machine the gateway runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub cpu_model: String,
    /// Physical core count.
    pub cpu_cores: u32,
    /// Logical core count.
    pub cpu_threads: u32,
    /// Nominal frequency in GHz (0.0 when unknown).
    pub cpu_ghz: f64,
    pub features: CpuFeatures,
    pub gpu_vendor: GpuVendor,
    pub gpu_model: String,
    /// VRAM in MiB; 0 when no GPU was detected.
    pub gpu_vram_mb: u64,
    pub total_ram_mb: u64,
    pub accel: AccelSupport,
    /// Per field-group provenance: `cpu`, `cpu_features`, `gpu`, `memory`,
    /// `accel`.
    #[serde(default)]
    pub sources: BTreeMap<String, ProbeSource>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            cpu_model: "Unknown".to_string(),
            cpu_cores: 1,
            cpu_threads: 1,
            cpu_ghz: 0.0,
            features: CpuFeatures::default(),
            gpu_vendor: GpuVendor::None,
            gpu_model: "Unknown".to_string(),
            gpu_vram_mb: 0,
            total_ram_mb: 0,
            accel: AccelSupport::default(),
            sources: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl HardwareProfile {
    pub fn set_source(&mut self, group: &str, source: ProbeSource) {
        self.sources.insert(group.to_string(), source);
    }

    /// True when any GPU acceleration API usable by the runtime is present.
    pub fn gpu_usable(&self) -> bool {
        match self.gpu_vendor {
            GpuVendor::Nvidia => self.accel.cuda,
            GpuVendor::Amd => self.accel.rocm,
            GpuVendor::AppleSilicon => self.accel.metal,
            GpuVendor::Intel => self.accel.vulkan || self.accel.opencl,
            GpuVendor::None => false,
        }
    }
}

/// Launch parameters for the native runtime, derived by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeParameters {
    pub n_threads: u32,
    pub n_gpu_layers: u32,
    pub batch_size: u32,
    pub context_size: u32,
    /// Multi-GPU tensor split. Opaque to the optimizer: passed through to
    /// the runtime without interpretation.
    #[serde(default)]
    pub tensor_split: Vec<f32>,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for RuntimeParameters {
    fn default() -> Self {
        Self {
            n_threads: 4,
            n_gpu_layers: 0,
            batch_size: 512,
            context_size: 2048,
            tensor_split: Vec::new(),
            rope_freq_base: 10_000.0,
            rope_freq_scale: 1.0,
            extra: BTreeMap::new(),
        }
    }
}

/// Build flags for compiling the native runtime, recomputed from the
/// hardware profile. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompilationFlags {
    pub build_type: String,
    pub cpu_arch_flags: Vec<String>,
    pub cmake_flags: Vec<String>,
    pub make_flags: Vec<String>,
    pub use_cuda: bool,
    pub use_rocm: bool,
    pub use_metal: bool,
    pub use_vulkan: bool,
    pub use_openmp: bool,
}

/// One timed request inside a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchIteration {
    pub tokens: u32,
    pub elapsed_ms: f64,
}

/// Aggregated benchmark outcome. Appended to the profile document;
/// retention is bounded by [`MAX_BENCHMARK_HISTORY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BenchmarkRecord {
    pub tokens_per_second: f64,
    pub latency_ms: f64,
    pub memory_mb: u64,
    pub prompt: String,
    #[serde(default)]
    pub iterations: Vec<BenchIteration>,
    pub parameters: RuntimeParameters,
    /// Set when the benchmark failed; metrics are zeroed in that case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The persisted document. Replaced atomically on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationProfile {
    pub schema_version: u32,
    pub hardware: HardwareProfile,
    pub runtime: RuntimeParameters,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OptimizationProfile {
    pub fn new(hardware: HardwareProfile, runtime: RuntimeParameters) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            hardware,
            runtime,
            benchmarks: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    /// Append a benchmark record, dropping the oldest beyond the retention
    /// bound.
    pub fn push_benchmark(&mut self, record: BenchmarkRecord) {
        self.benchmarks.push(record);
        if self.benchmarks.len() > MAX_BENCHMARK_HISTORY {
            let excess = self.benchmarks.len() - MAX_BENCHMARK_HISTORY;
            self.benchmarks.drain(0..excess);
        }
    }

    /// Stamp the document as freshly updated. The updated timestamp never
    /// predates any contained measurement because every mutation path calls
    /// this last.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_vendor_display() {
        assert_eq!(GpuVendor::Nvidia.to_string(), "NVIDIA");
        assert_eq!(GpuVendor::AppleSilicon.to_string(), "Apple Silicon");
        assert_eq!(GpuVendor::None.to_string(), "none");
    }

    #[test]
    fn test_profile_serde_roundtrip() {
        let mut hw = HardwareProfile::default();
        hw.cpu_model = "Test CPU @ 3.50GHz".into();
        hw.set_source("cpu", ProbeSource::Probed);
        let profile = OptimizationProfile::new(hw, RuntimeParameters::default());

        let json = serde_json::to_string(&profile).expect("serialize");
        let back: OptimizationProfile = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(profile, back);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = serde_json::json!({
            "schema_version": 1,
            "hardware": HardwareProfile::default(),
            "runtime": RuntimeParameters::default(),
            "benchmarks": [],
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
            "future_field": {"nested": true},
        });
        let profile: OptimizationProfile =
            serde_json::from_value(json).expect("deserialize with unknown field");
        assert!(profile.extra.contains_key("future_field"));

        let round = serde_json::to_value(&profile).expect("serialize");
        assert_eq!(round["future_field"]["nested"], serde_json::json!(true));
    }

    #[test]
    fn test_benchmark_history_is_bounded() {
        let mut profile =
            OptimizationProfile::new(HardwareProfile::default(), RuntimeParameters::default());
        for i in 0..(MAX_BENCHMARK_HISTORY + 5) {
            profile.push_benchmark(BenchmarkRecord {
                prompt: format!("p{i}"),
                ..Default::default()
            });
        }
        assert_eq!(profile.benchmarks.len(), MAX_BENCHMARK_HISTORY);
        // Oldest entries were dropped.
        assert_eq!(profile.benchmarks[0].prompt, "p5");
    }

    #[test]
    fn test_gpu_usable_requires_matching_api() {
        let mut hw = HardwareProfile::default();
        hw.gpu_vendor = GpuVendor::Nvidia;
        assert!(!hw.gpu_usable(), "NVIDIA without CUDA is not usable");
        hw.accel.cuda = true;
        assert!(hw.gpu_usable());
    }
}
