//! macOS probes: `sysctl` for the CPU, `system_profiler` for displays.

use super::run_probe;
use crate::profile::{GpuVendor, HardwareProfile, ProbeSource};
use tracing::warn;

pub(super) fn probe_cpu(profile: &mut HardwareProfile) {
    match run_probe("sysctl", &["-n", "machdep.cpu.brand_string"]) {
        Some(brand) if !brand.trim().is_empty() => {
            profile.cpu_model = brand.trim().to_string();
            profile.set_source("cpu", ProbeSource::Probed);
        }
        _ => {
            warn!("sysctl brand_string query failed");
            profile.set_source("cpu", ProbeSource::Unknown);
            return;
        }
    }

    if profile.cpu_model.contains("Apple") {
        // Apple Silicon has no AVX; NEON is implied and not tracked here.
        profile.set_source("cpu_features", ProbeSource::Probed);
        return;
    }

    // Intel Mac: hw.optional flags.
    match run_probe("sysctl", &["-a"]) {
        Some(out) => {
            let out = out.to_lowercase();
            profile.features.avx = out.contains("hw.optional.avx1_0: 1");
            profile.features.avx2 = out.contains("hw.optional.avx2_0: 1");
            profile.features.avx512 = out.contains("hw.optional.avx512f: 1");
            profile.features.f16c = out.contains("hw.optional.f16c: 1");
            profile.features.fma = out.contains("hw.optional.fma: 1");
            profile.set_source("cpu_features", ProbeSource::Probed);
        }
        None => profile.set_source("cpu_features", ProbeSource::Unknown),
    }
}

pub(super) fn probe_gpu(profile: &mut HardwareProfile) {
    if profile.cpu_model.contains("Apple") {
        profile.gpu_vendor = GpuVendor::AppleSilicon;
        profile.gpu_model = profile.cpu_model.clone();
        // Unified memory: VRAM is not a separate pool; leave 0 and let the
        // optimizer treat Metal as usable.
        profile.set_source("gpu", ProbeSource::Probed);
        return;
    }

    let out = match run_probe("system_profiler", &["SPDisplaysDataType"]) {
        Some(out) => out,
        None => {
            warn!("system_profiler query failed");
            profile.set_source("gpu", ProbeSource::Unknown);
            return;
        }
    };

    for line in out.lines() {
        let line = line.trim();
        if let Some(model) = line.strip_prefix("Chipset Model:") {
            let model = model.trim().to_string();
            profile.gpu_vendor = if model.contains("AMD") || model.contains("Radeon") {
                GpuVendor::Amd
            } else if model.contains("NVIDIA") || model.contains("GeForce") {
                GpuVendor::Nvidia
            } else if model.contains("Intel") {
                GpuVendor::Intel
            } else {
                GpuVendor::None
            };
            profile.gpu_model = model;
        }
        if let Some(rest) = line.strip_prefix("VRAM") {
            // e.g. "VRAM (Total): 4 GB" / "VRAM (Dynamic, Max): 1536 MB"
            if let Some(value) = rest.split(':').nth(1) {
                let value = value.trim();
                let mut parts = value.split_whitespace();
                if let (Some(amount), Some(unit)) = (parts.next(), parts.next()) {
                    if let Ok(amount) = amount.parse::<u64>() {
                        profile.gpu_vram_mb = match unit.to_uppercase().as_str() {
                            "GB" => amount * 1024,
                            _ => amount,
                        };
                    }
                }
            }
        }
    }

    if profile.gpu_vendor == GpuVendor::None {
        profile.set_source("gpu", ProbeSource::Unknown);
    } else {
        profile.set_source("gpu", ProbeSource::Probed);
    }
}

pub(super) fn probe_accel(profile: &mut HardwareProfile) {
    // Metal is available on every supported macOS; CUDA/ROCm are not.
    profile.accel.metal = true;
    profile.accel.cuda = false;
    profile.accel.rocm = false;
    profile.accel.vulkan = run_probe("vulkaninfo", &["--summary"]).is_some();
    profile.accel.opencl = true;
    profile.set_source("accel", ProbeSource::Probed);
}
