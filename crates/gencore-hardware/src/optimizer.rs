//! Parameter optimization: staleness checks, compile-flag and runtime
//! derivation tables, and the benchmark loop.
//!
//! Derivations are pure functions of the [`HardwareProfile`] so the tables
//! stay testable; only [`Optimizer::update_profile`] and the benchmark
//! touch the OS. Nothing here is fatal: probe problems degrade to
//! sentinels and a failed benchmark produces a zeroed record with an
//! `error` field.

use crate::detect;
use crate::profile::{
    BenchIteration, BenchmarkRecord, CompilationFlags, GpuVendor, HardwareProfile,
    OptimizationProfile, RuntimeParameters,
};
use crate::store::{ProfileStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Instant;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};

/// Default benchmark prompt.
const BENCH_PROMPT: &str = "Explain the theory of relativity in simple terms.";
/// Fixed sampling for benchmark requests.
const BENCH_MAX_TOKENS: u32 = 100;
const BENCH_TEMPERATURE: f32 = 0.7;

/// Tuning knobs for the optimizer itself.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Profile age beyond which a re-probe is required.
    pub stale_after_days: i64,
    /// Total-RAM change that invalidates the profile.
    pub ram_delta_mb: u64,
    /// Leave one physical core free for interactive load.
    pub reserve_interactive_core: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 30,
            ram_delta_mb: 1024,
            reserve_interactive_core: true,
        }
    }
}

/// Seam between the optimizer and whatever produces tokens during a
/// benchmark. The gateway adapts its live backend to this.
#[async_trait]
pub trait BenchRunner: Send + Sync {
    /// Issue one generation request and report how many tokens it emitted.
    async fn run(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<BenchSample, String>;

    /// Release runner resources. Called on every benchmark exit path.
    async fn shutdown(&self);
}

/// Outcome of a single benchmark request.
#[derive(Debug, Clone, Copy)]
pub struct BenchSample {
    pub tokens: u32,
}

/// Result bundle from [`Optimizer::run_full`].
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    /// The persisted document (hardware + runtime + benchmark history).
    pub profile: OptimizationProfile,
    pub flags: CompilationFlags,
    pub bench: BenchmarkRecord,
}

/// Drives hardware probing, parameter derivation, and benchmarking around
/// a [`ProfileStore`].
pub struct Optimizer {
    store: ProfileStore,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(store: ProfileStore) -> Self {
        Self {
            store,
            config: OptimizerConfig::default(),
        }
    }

    pub fn with_config(store: ProfileStore, config: OptimizerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// True when `profile` no longer describes `current` hardware, or is
    /// simply too old. Any single condition suffices.
    pub fn is_profile_stale(
        &self,
        profile: &OptimizationProfile,
        current: &HardwareProfile,
        now: DateTime<Utc>,
    ) -> bool {
        let saved = &profile.hardware;
        if saved.total_ram_mb.abs_diff(current.total_ram_mb) > self.config.ram_delta_mb {
            return true;
        }
        if saved.cpu_model != current.cpu_model {
            return true;
        }
        if saved.gpu_model != current.gpu_model {
            return true;
        }
        if saved.accel != current.accel {
            return true;
        }
        now.signed_duration_since(profile.updated_at)
            > ChronoDuration::days(self.config.stale_after_days)
    }

    /// Re-probe the hardware, recompute runtime parameters, and persist the
    /// document. Benchmark history and `created_at` carry over.
    pub fn update_profile(&self) -> Result<OptimizationProfile, StoreError> {
        let hardware = detect::probe();
        let runtime = self.compute_runtime(&hardware, None);

        let mut profile = match self.store.load() {
            Ok(Some(existing)) => existing,
            Ok(None) => OptimizationProfile::new(hardware.clone(), runtime.clone()),
            Err(e) => {
                warn!(error = %e, "existing profile unreadable, starting fresh");
                OptimizationProfile::new(hardware.clone(), runtime.clone())
            }
        };
        profile.hardware = hardware;
        profile.runtime = runtime;
        profile.touch();
        self.store.save(&profile)?;
        Ok(profile)
    }

    /// Load the stored profile, refreshing it when missing, stale, or
    /// `force` is set.
    pub fn ensure_profile(&self, force: bool) -> Result<OptimizationProfile, StoreError> {
        let existing = match self.store.load() {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "profile load failed, re-probing");
                None
            }
        };
        match existing {
            Some(profile) if !force => {
                let current = detect::probe();
                if self.is_profile_stale(&profile, &current, Utc::now()) {
                    info!("optimization profile is stale, refreshing");
                    self.update_profile()
                } else {
                    Ok(profile)
                }
            }
            _ => self.update_profile(),
        }
    }

    /// Derive native-runtime build flags from the hardware profile.
    pub fn compute_flags(hardware: &HardwareProfile) -> CompilationFlags {
        let mut flags = CompilationFlags {
            build_type: "Release".to_string(),
            use_openmp: true,
            ..Default::default()
        };
        flags.cmake_flags.push("-DCMAKE_BUILD_TYPE=Release".into());

        let f = &hardware.features;
        if f.avx512 {
            flags.cpu_arch_flags.extend(
                ["-march=skylake-avx512", "-mavx512f", "-mavx512dq", "-mavx512bw", "-mavx512vl"]
                    .map(String::from),
            );
        } else if f.avx2 {
            flags
                .cpu_arch_flags
                .extend(["-march=haswell", "-mavx2", "-mfma"].map(String::from));
        } else if f.avx {
            flags
                .cpu_arch_flags
                .extend(["-march=sandybridge", "-mavx"].map(String::from));
        } else {
            flags.cpu_arch_flags.push("-march=native".into());
        }

        let cpu = hardware.cpu_model.to_lowercase();
        if cpu.contains("intel") {
            flags.cmake_flags.push("-DLLAMA_BLAS=ON".into());
            flags.cmake_flags.push("-DLLAMA_BLAS_VENDOR=Intel10_64lp".into());
        } else if cpu.contains("amd") {
            flags.cmake_flags.push("-DLLAMA_BLAS=ON".into());
            flags.cmake_flags.push("-DLLAMA_BLAS_VENDOR=FLAME".into());
        }

        if hardware.gpu_vendor == GpuVendor::Nvidia && hardware.accel.cuda {
            flags.use_cuda = true;
            flags.cmake_flags.push("-DLLAMA_CUDA=ON".into());
            if hardware.gpu_vram_mb < 6000 {
                flags.cmake_flags.push("-DLLAMA_CUDA_DMMV_X=32".into());
                flags.cmake_flags.push("-DLLAMA_CUDA_MMV_Y=32".into());
            }
        }
        if hardware.gpu_vendor == GpuVendor::Amd && hardware.accel.rocm {
            flags.use_rocm = true;
            flags.cmake_flags.push("-DLLAMA_HIPBLAS=ON".into());
        }
        if hardware.accel.vulkan && !flags.use_cuda && !flags.use_rocm {
            flags.use_vulkan = true;
            flags.cmake_flags.push("-DLLAMA_VULKAN=ON".into());
        }
        if hardware.accel.metal {
            flags.use_metal = true;
            flags.cmake_flags.push("-DLLAMA_METAL=ON".into());
        }
        if flags.use_openmp {
            flags.cmake_flags.push("-DLLAMA_NATIVE=ON".into());
        }

        flags.make_flags.push(format!("-j{}", hardware.cpu_threads.max(1)));
        flags
    }

    /// Derive runtime launch parameters. `model_vram_hint_mb` is the
    /// approximate VRAM the model needs; when it exceeds the budget the
    /// GPU-layer choice steps down one bucket.
    pub fn compute_runtime(
        &self,
        hardware: &HardwareProfile,
        model_vram_hint_mb: Option<u64>,
    ) -> RuntimeParameters {
        let cores = hardware.cpu_cores.max(1);
        let n_threads = if self.config.reserve_interactive_core {
            cores.saturating_sub(1).max(1)
        } else {
            cores
        };

        let n_gpu_layers = gpu_layers_for(hardware, model_vram_hint_mb);

        let ram = hardware.total_ram_mb;
        let batch_size = if ram > 32_000 {
            1024
        } else if ram > 16_000 {
            512
        } else if ram > 8_000 {
            256
        } else {
            128
        };
        let context_size = if ram > 32_000 {
            8192
        } else if ram > 16_000 {
            4096
        } else if ram > 8_000 {
            2048
        } else {
            1024
        };

        RuntimeParameters {
            n_threads,
            n_gpu_layers,
            batch_size,
            context_size,
            ..Default::default()
        }
    }

    /// Run `iterations` identical generation requests against `runner` and
    /// aggregate the mean. The runner is shut down on every exit path.
    pub async fn benchmark(
        &self,
        runner: &dyn BenchRunner,
        params: &RuntimeParameters,
        prompt: Option<&str>,
        iterations: usize,
    ) -> BenchmarkRecord {
        let prompt = prompt.unwrap_or(BENCH_PROMPT);
        let rss_before = process_rss_mb();
        let mut samples: Vec<BenchIteration> = Vec::new();
        let mut last_error = None;

        for i in 0..iterations.max(1) {
            let start = Instant::now();
            match runner.run(prompt, BENCH_MAX_TOKENS, BENCH_TEMPERATURE).await {
                Ok(sample) => {
                    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                    info!(
                        iteration = i + 1,
                        tokens = sample.tokens,
                        elapsed_ms = format!("{elapsed_ms:.1}"),
                        "benchmark iteration complete"
                    );
                    samples.push(BenchIteration {
                        tokens: sample.tokens,
                        elapsed_ms,
                    });
                }
                Err(e) => {
                    warn!(iteration = i + 1, error = %e, "benchmark iteration failed");
                    last_error = Some(e);
                }
            }
        }

        runner.shutdown().await;

        let record = if samples.is_empty() {
            BenchmarkRecord {
                prompt: prompt.to_string(),
                parameters: params.clone(),
                error: Some(last_error.unwrap_or_else(|| "no iterations completed".into())),
                ..Default::default()
            }
        } else {
            let total_tokens: u64 = samples.iter().map(|s| s.tokens as u64).sum();
            let total_ms: f64 = samples.iter().map(|s| s.elapsed_ms).sum();
            let mean_latency = total_ms / samples.len() as f64;
            let tokens_per_second = if total_ms > 0.0 {
                total_tokens as f64 / (total_ms / 1000.0)
            } else {
                0.0
            };
            BenchmarkRecord {
                tokens_per_second,
                latency_ms: mean_latency,
                memory_mb: process_rss_mb().saturating_sub(rss_before),
                prompt: prompt.to_string(),
                iterations: samples,
                parameters: params.clone(),
                error: None,
            }
        };
        record
    }

    /// Synthesise a plausible benchmark from the profile alone, for
    /// environments without a runnable backend.
    pub fn mock_benchmark(
        &self,
        hardware: &HardwareProfile,
        params: &RuntimeParameters,
        prompt: Option<&str>,
    ) -> BenchmarkRecord {
        let prompt = prompt.unwrap_or(BENCH_PROMPT);
        let base_speed = 15.0_f64;
        let cpu_factor = (hardware.cpu_threads as f64 / 2.0).min(2.0).max(0.1);
        let ram_factor = (hardware.total_ram_mb as f64 / 8000.0).min(2.0).max(0.1);
        let gpu_factor = if params.n_gpu_layers > 0 && hardware.gpu_vram_mb > 0 {
            1.5 + (hardware.gpu_vram_mb as f64 / 4000.0).min(2.0)
        } else {
            1.0
        };
        let batch_factor = (params.batch_size as f64 / 256.0).min(1.5);

        let mut rng = rand::thread_rng();
        let tokens_per_second = base_speed * cpu_factor * ram_factor * gpu_factor * batch_factor;
        let latency_ms = 100.0 / cpu_factor;

        BenchmarkRecord {
            tokens_per_second: tokens_per_second * (0.9 + rng.r#gen::<f64>() * 0.2),
            latency_ms: latency_ms * (0.9 + rng.r#gen::<f64>() * 0.2),
            memory_mb: process_rss_mb(),
            prompt: prompt.to_string(),
            iterations: Vec::new(),
            parameters: params.clone(),
            error: None,
        }
    }

    /// Full pass: refresh the profile, derive flags and parameters, run a
    /// benchmark (real when a runner is supplied, mock otherwise), and
    /// persist everything.
    pub async fn run_full(
        &self,
        runner: Option<&dyn BenchRunner>,
        model_vram_hint_mb: Option<u64>,
    ) -> Result<OptimizationReport, StoreError> {
        let mut profile = self.update_profile()?;
        profile.runtime = self.compute_runtime(&profile.hardware, model_vram_hint_mb);
        let flags = Self::compute_flags(&profile.hardware);

        let bench = match runner {
            Some(runner) => self.benchmark(runner, &profile.runtime, None, 3).await,
            None => self.mock_benchmark(&profile.hardware, &profile.runtime, None),
        };
        profile.push_benchmark(bench.clone());
        profile.touch();
        self.store.save(&profile)?;

        info!(
            tokens_per_second = format!("{:.2}", bench.tokens_per_second),
            threads = profile.runtime.n_threads,
            gpu_layers = profile.runtime.n_gpu_layers,
            "optimization pass complete"
        );
        Ok(OptimizationReport {
            profile,
            flags,
            bench,
        })
    }
}

/// GPU-layer bucket tables, per vendor. The bucket index steps down by one
/// when the model's VRAM requirement exceeds the card's budget.
fn gpu_layers_for(hardware: &HardwareProfile, model_vram_hint_mb: Option<u64>) -> u32 {
    if !hardware.gpu_usable() {
        return 0;
    }
    // Apple unified memory has no separate VRAM pool; offload fully.
    if hardware.gpu_vendor == GpuVendor::AppleSilicon {
        return 32;
    }

    let buckets: &[(u64, u32)] = match hardware.gpu_vendor {
        GpuVendor::Nvidia => &[(8000, 32), (4000, 20), (1, 8)],
        GpuVendor::Amd => &[(8000, 28), (4000, 16), (1, 4)],
        // Integrated Intel parts run through Vulkan/OpenCL with a small
        // fixed offload.
        GpuVendor::Intel => &[(1, 4)],
        _ => return 0,
    };

    let vram = hardware.gpu_vram_mb;
    let Some(mut index) = buckets.iter().position(|(floor, _)| vram >= *floor) else {
        return 0;
    };
    if let Some(hint) = model_vram_hint_mb {
        if hint > vram {
            index += 1;
        }
    }
    buckets.get(index).map(|(_, layers)| *layers).unwrap_or(0)
}

fn process_rss_mb() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    sys.process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{AccelSupport, CpuFeatures};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn optimizer_in(dir: &tempfile::TempDir) -> Optimizer {
        Optimizer::new(ProfileStore::new(dir.path().join("profile.json")))
    }

    fn hw(ram_mb: u64, cores: u32) -> HardwareProfile {
        HardwareProfile {
            cpu_model: "Test CPU".into(),
            cpu_cores: cores,
            cpu_threads: cores * 2,
            total_ram_mb: ram_mb,
            ..Default::default()
        }
    }

    fn nvidia(vram_mb: u64) -> HardwareProfile {
        let mut h = hw(32_768, 8);
        h.gpu_vendor = GpuVendor::Nvidia;
        h.gpu_model = "NVIDIA GeForce RTX".into();
        h.gpu_vram_mb = vram_mb;
        h.accel.cuda = true;
        h
    }

    // ── runtime parameter tables ─────────────────────────────────────────

    #[test]
    fn test_threads_reserve_interactive_core() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        assert_eq!(opt.compute_runtime(&hw(16_000, 8), None).n_threads, 7);
        assert_eq!(opt.compute_runtime(&hw(16_000, 1), None).n_threads, 1);
    }

    #[test]
    fn test_threads_without_reservation_use_all_cores() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Optimizer::with_config(
            ProfileStore::new(dir.path().join("p.json")),
            OptimizerConfig {
                reserve_interactive_core: false,
                ..Default::default()
            },
        );
        assert_eq!(opt.compute_runtime(&hw(16_000, 8), None).n_threads, 8);
    }

    #[test]
    fn test_batch_and_context_scale_with_ram() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        for (ram, batch, ctx) in [
            (64_000, 1024, 8192),
            (24_000, 512, 4096),
            (12_000, 256, 2048),
            (4_000, 128, 1024),
        ] {
            let params = opt.compute_runtime(&hw(ram, 8), None);
            assert_eq!(params.batch_size, batch, "ram={ram}");
            assert_eq!(params.context_size, ctx, "ram={ram}");
        }
    }

    #[test]
    fn test_floors_hold_for_tiny_machines() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let params = opt.compute_runtime(&hw(512, 1), None);
        assert!(params.batch_size >= 128);
        assert!(params.context_size >= 1024);
        assert!(params.n_threads >= 1);
    }

    // ── GPU layer selection ──────────────────────────────────────────────

    #[test]
    fn test_nvidia_gpu_layer_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        assert_eq!(opt.compute_runtime(&nvidia(12_000), None).n_gpu_layers, 32);
        assert_eq!(opt.compute_runtime(&nvidia(6_000), None).n_gpu_layers, 20);
        assert_eq!(opt.compute_runtime(&nvidia(2_000), None).n_gpu_layers, 8);
    }

    #[test]
    fn test_amd_gpu_layer_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let mut h = hw(32_768, 8);
        h.gpu_vendor = GpuVendor::Amd;
        h.gpu_model = "AMD Radeon RX".into();
        h.accel.rocm = true;
        h.gpu_vram_mb = 8_192;
        assert_eq!(opt.compute_runtime(&h, None).n_gpu_layers, 28);
        h.gpu_vram_mb = 4_096;
        assert_eq!(opt.compute_runtime(&h, None).n_gpu_layers, 16);
        h.gpu_vram_mb = 2_048;
        assert_eq!(opt.compute_runtime(&h, None).n_gpu_layers, 4);
    }

    #[test]
    fn test_vram_hint_steps_down_one_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        // 8 GiB card, but the model wants ~10 GiB: drop from 32 to 20.
        assert_eq!(
            opt.compute_runtime(&nvidia(8_192), Some(10_000)).n_gpu_layers,
            20
        );
        // Smallest bucket steps down to zero.
        assert_eq!(
            opt.compute_runtime(&nvidia(2_000), Some(4_000)).n_gpu_layers,
            0
        );
    }

    #[test]
    fn test_no_usable_gpu_means_no_offload() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        // NVIDIA card without CUDA available.
        let mut h = nvidia(8_192);
        h.accel.cuda = false;
        assert_eq!(opt.compute_runtime(&h, None).n_gpu_layers, 0);
        assert_eq!(opt.compute_runtime(&hw(16_000, 8), None).n_gpu_layers, 0);
    }

    // ── compilation flags ────────────────────────────────────────────────

    #[test]
    fn test_flags_select_best_simd_tier() {
        let mut h = hw(16_000, 8);
        h.features = CpuFeatures {
            avx: true,
            avx2: true,
            avx512: true,
            ..Default::default()
        };
        let flags = Optimizer::compute_flags(&h);
        assert!(flags.cpu_arch_flags.contains(&"-march=skylake-avx512".to_string()));

        h.features.avx512 = false;
        let flags = Optimizer::compute_flags(&h);
        assert!(flags.cpu_arch_flags.contains(&"-march=haswell".to_string()));

        h.features.avx2 = false;
        let flags = Optimizer::compute_flags(&h);
        assert!(flags.cpu_arch_flags.contains(&"-march=sandybridge".to_string()));

        h.features.avx = false;
        let flags = Optimizer::compute_flags(&h);
        assert!(flags.cpu_arch_flags.contains(&"-march=native".to_string()));
    }

    #[test]
    fn test_flags_pick_blas_vendor_by_cpu() {
        let mut h = hw(16_000, 8);
        h.cpu_model = "Intel(R) Core(TM) i9".into();
        assert!(
            Optimizer::compute_flags(&h)
                .cmake_flags
                .contains(&"-DLLAMA_BLAS_VENDOR=Intel10_64lp".to_string())
        );
        h.cpu_model = "AMD Ryzen 9".into();
        assert!(
            Optimizer::compute_flags(&h)
                .cmake_flags
                .contains(&"-DLLAMA_BLAS_VENDOR=FLAME".to_string())
        );
    }

    #[test]
    fn test_flags_cuda_low_vram_tuning() {
        let h = nvidia(4_096);
        let flags = Optimizer::compute_flags(&h);
        assert!(flags.use_cuda);
        assert!(flags.cmake_flags.contains(&"-DLLAMA_CUDA=ON".to_string()));
        assert!(flags.cmake_flags.contains(&"-DLLAMA_CUDA_DMMV_X=32".to_string()));

        let big = nvidia(12_288);
        let flags = Optimizer::compute_flags(&big);
        assert!(!flags.cmake_flags.contains(&"-DLLAMA_CUDA_DMMV_X=32".to_string()));
    }

    // ── staleness ────────────────────────────────────────────────────────

    #[test]
    fn test_staleness_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let base = hw(16_384, 8);
        let profile = OptimizationProfile::new(base.clone(), RuntimeParameters::default());
        let now = Utc::now();

        assert!(!opt.is_profile_stale(&profile, &base, now), "fresh profile");

        let mut ram_changed = base.clone();
        ram_changed.total_ram_mb += 2048;
        assert!(opt.is_profile_stale(&profile, &ram_changed, now));

        let mut small_ram_delta = base.clone();
        small_ram_delta.total_ram_mb += 512;
        assert!(!opt.is_profile_stale(&profile, &small_ram_delta, now));

        let mut cpu_changed = base.clone();
        cpu_changed.cpu_model = "Different CPU".into();
        assert!(opt.is_profile_stale(&profile, &cpu_changed, now));

        let mut gpu_changed = base.clone();
        gpu_changed.gpu_model = "New GPU".into();
        assert!(opt.is_profile_stale(&profile, &gpu_changed, now));

        let mut accel_changed = base.clone();
        accel_changed.accel = AccelSupport {
            cuda: true,
            ..Default::default()
        };
        assert!(opt.is_profile_stale(&profile, &accel_changed, now));
    }

    #[test]
    fn test_staleness_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let base = hw(16_384, 8);
        let mut profile = OptimizationProfile::new(base.clone(), RuntimeParameters::default());
        profile.updated_at = Utc::now() - ChronoDuration::days(31);
        assert!(opt.is_profile_stale(&profile, &base, Utc::now()));

        profile.updated_at = Utc::now() - ChronoDuration::days(29);
        assert!(!opt.is_profile_stale(&profile, &base, Utc::now()));
    }

    #[test]
    fn test_stale_profile_is_rewritten_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);

        // Seed a 31-day-old profile for this machine.
        let mut profile = opt.update_profile().unwrap();
        profile.updated_at = Utc::now() - ChronoDuration::days(31);
        opt.store().save(&profile).unwrap();

        let refreshed = opt.ensure_profile(false).unwrap();
        assert!(
            refreshed.updated_at > Utc::now() - ChronoDuration::minutes(1),
            "stale profile must be refreshed and persisted"
        );
        let on_disk = opt.store().load().unwrap().unwrap();
        assert_eq!(on_disk.updated_at, refreshed.updated_at);
    }

    // ── benchmarks ───────────────────────────────────────────────────────

    struct FakeRunner {
        fail: bool,
        calls: AtomicUsize,
        shut_down: AtomicBool,
    }

    impl FakeRunner {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl BenchRunner for FakeRunner {
        async fn run(
            &self,
            _prompt: &str,
            max_tokens: u32,
            _temperature: f32,
        ) -> Result<BenchSample, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("backend unavailable".into())
            } else {
                Ok(BenchSample { tokens: max_tokens })
            }
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_benchmark_aggregates_mean() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let runner = FakeRunner::new(false);
        let record = opt
            .benchmark(&runner, &RuntimeParameters::default(), None, 3)
            .await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert!(runner.shut_down.load(Ordering::SeqCst));
        assert!(record.error.is_none());
        assert_eq!(record.iterations.len(), 3);
        assert!(record.tokens_per_second > 0.0);
        assert!(record.latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_benchmark_failure_zeroes_metrics_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let runner = FakeRunner::new(true);
        let record = opt
            .benchmark(&runner, &RuntimeParameters::default(), None, 2)
            .await;

        assert!(runner.shut_down.load(Ordering::SeqCst), "shutdown on failure path");
        assert_eq!(record.tokens_per_second, 0.0);
        assert_eq!(record.latency_ms, 0.0);
        assert_eq!(record.error.as_deref(), Some("backend unavailable"));
    }

    #[test]
    fn test_mock_benchmark_scales_with_gpu() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let cpu_only = hw(16_384, 8);
        let params_cpu = opt.compute_runtime(&cpu_only, None);
        let slow = opt.mock_benchmark(&cpu_only, &params_cpu, None);

        let gpu = nvidia(8_192);
        let params_gpu = opt.compute_runtime(&gpu, None);
        let fast = opt.mock_benchmark(&gpu, &params_gpu, None);

        assert!(slow.tokens_per_second > 0.0);
        // GPU factor is at least 1.5x even with jitter.
        assert!(fast.tokens_per_second > slow.tokens_per_second);
        assert!(slow.error.is_none());
    }

    #[tokio::test]
    async fn test_run_full_persists_benchmark_history() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer_in(&dir);
        let report = opt.run_full(None, None).await.unwrap();
        assert_eq!(report.profile.benchmarks.len(), 1);
        assert!(!report.flags.cmake_flags.is_empty());

        let on_disk = opt.store().load().unwrap().unwrap();
        assert_eq!(on_disk.benchmarks.len(), 1);
    }
}
