//! Hardware detection and inference-parameter optimization for GenCore.
//!
//! The crate covers three concerns:
//!
//! - [`profile`] — the persisted data model: [`profile::HardwareProfile`],
//!   derived [`profile::RuntimeParameters`] and [`profile::CompilationFlags`],
//!   and bounded benchmark history, all wrapped in a schema-versioned
//!   [`profile::OptimizationProfile`] document.
//! - [`detect`] — platform probes (`/proc`, `nvidia-smi`, `rocm-smi`,
//!   `sysctl`, PowerShell CIM) that populate a profile. Each sub-probe is
//!   isolated: a GPU probe failure never breaks CPU detection, and missing
//!   information degrades to documented sentinels tagged with their source.
//! - [`optimizer`] — staleness checks, the flag/parameter derivation
//!   tables, and the benchmark loop (plus a mock variant that synthesises
//!   plausible numbers from the profile alone).
//!
//! No failure in this crate is ever fatal to server startup; probes log and
//! degrade, benchmarks return zeroed records with an error field.

pub mod detect;
pub mod optimizer;
pub mod profile;
pub mod store;

pub use detect::probe;
pub use optimizer::{BenchRunner, BenchSample, OptimizationReport, Optimizer, OptimizerConfig};
pub use profile::{
    AccelSupport, BenchmarkRecord, CompilationFlags, CpuFeatures, GpuVendor, HardwareProfile,
    OptimizationProfile, ProbeSource, RuntimeParameters, SCHEMA_VERSION,
};
pub use store::{ProfileStore, StoreError};
