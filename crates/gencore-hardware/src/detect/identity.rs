//! Pure fallback derivations from the CPU identity string.
//!
//! Used only when direct probing returns nothing. Everything here is a
//! table over the brand string with no OS queries, so it is exercised
//! with table-driven tests. Applied values are tagged
//! [`ProbeSource::Fallback`].

use crate::profile::{CpuFeatures, GpuVendor, HardwareProfile, ProbeSource};

/// Defaults guessed from a CPU identity string.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IdentityDefaults {
    pub features: CpuFeatures,
    pub gpu_vendor: GpuVendor,
    pub gpu_model: Option<String>,
    pub gpu_vram_mb: u64,
}

/// Derive plausible SIMD features and an integrated-GPU guess from the CPU
/// brand string.
pub fn derive_from_cpu_identity(cpu_model: &str) -> IdentityDefaults {
    let model = cpu_model.to_lowercase();
    let mut out = IdentityDefaults::default();

    // SIMD features by family.
    if ["ryzen", "epyc", "threadripper"].iter().any(|m| model.contains(m)) {
        out.features.avx = true;
        out.features.avx2 = true;
        if ['3', '5', '7', '9'].iter().any(|g| model.contains(*g)) {
            out.features.fma = true;
        }
    }
    if ["i9", "i7-8", "i7-9", "i7-10", "i7-11", "i7-12"]
        .iter()
        .any(|m| model.contains(m))
    {
        out.features.avx = true;
        out.features.avx2 = true;
        out.features.fma = true;
    }
    // AVX-512 shipped broadly with Ice Lake / Rocket Lake era parts and Xeons.
    if ["xeon", "i9-10", "i9-11", "i7-11", "i5-11"]
        .iter()
        .any(|m| model.contains(m))
    {
        out.features.avx512 = true;
    }

    // Integrated-GPU guesses.
    if model.contains("intel") {
        let (gpu_model, vram) = if model.contains("13th") || model.contains("12th") {
            ("Intel Iris Xe Graphics", 2048)
        } else if model.contains("11th") || model.contains("10th") {
            ("Intel UHD Graphics", 1536)
        } else if model.contains("9th") || model.contains("8th") || model.contains("7th") {
            ("Intel UHD Graphics 630", 1024)
        } else {
            ("Intel HD Graphics", 512)
        };
        out.gpu_vendor = GpuVendor::Intel;
        out.gpu_model = Some(gpu_model.to_string());
        out.gpu_vram_mb = vram;
    } else if model.contains("amd") && (model.contains("ryzen") || model.contains("apu")) {
        let (gpu_model, vram) = if model.contains('7') || model.contains('6') {
            ("AMD Radeon Graphics (integrated)", 2048)
        } else {
            ("AMD Vega Graphics (integrated)", 1024)
        };
        out.gpu_vendor = GpuVendor::Amd;
        out.gpu_model = Some(gpu_model.to_string());
        out.gpu_vram_mb = vram;
    }

    out
}

/// Apply identity-derived defaults to a profile whose direct probes came
/// up empty. Never overwrites probed data.
pub fn apply_fallback(profile: &mut HardwareProfile) {
    let defaults = derive_from_cpu_identity(&profile.cpu_model);

    let features_probed = matches!(
        profile.sources.get("cpu_features"),
        Some(ProbeSource::Probed)
    );
    if !features_probed && defaults.features != CpuFeatures::default() {
        profile.features = defaults.features;
        profile.set_source("cpu_features", ProbeSource::Fallback);
    }

    if profile.gpu_vendor == GpuVendor::None {
        if let Some(gpu_model) = defaults.gpu_model {
            profile.gpu_vendor = defaults.gpu_vendor;
            profile.gpu_model = gpu_model;
            profile.gpu_vram_mb = defaults.gpu_vram_mb;
            profile.set_source("gpu", ProbeSource::Fallback);
            tracing::info!(
                gpu = %profile.gpu_model,
                vram_mb = profile.gpu_vram_mb,
                "no GPU probed, using identity-based fallback"
            );
        }
    }
}
