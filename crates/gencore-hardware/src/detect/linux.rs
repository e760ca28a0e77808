//! Linux probes: `/proc/cpuinfo`, device nodes, and vendor tools.
//!
//! Detection avoids linking GPU libraries at compile time; everything goes
//! through filesystem checks and tool output, so the crate stays light on
//! machines without any GPU stack installed.

use super::run_probe;
use crate::profile::{GpuVendor, HardwareProfile, ProbeSource};
use std::path::Path;
use tracing::warn;

pub(super) fn probe_cpu(profile: &mut HardwareProfile) {
    let cpuinfo = match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(contents) => contents,
        Err(e) => {
            warn!(error = %e, "failed to read /proc/cpuinfo");
            profile.set_source("cpu", ProbeSource::Unknown);
            profile.set_source("cpu_features", ProbeSource::Unknown);
            return;
        }
    };

    if let Some(model) = cpuinfo
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split(':').nth(1))
    {
        profile.cpu_model = model.trim().to_string();
        profile.set_source("cpu", ProbeSource::Probed);
    } else {
        profile.set_source("cpu", ProbeSource::Unknown);
    }

    if let Some(flags) = cpuinfo
        .lines()
        .find(|l| l.starts_with("flags"))
        .and_then(|l| l.split(':').nth(1))
    {
        let flags: Vec<&str> = flags.split_whitespace().collect();
        profile.features.avx = flags.contains(&"avx");
        profile.features.avx2 = flags.contains(&"avx2");
        profile.features.avx512 = flags.contains(&"avx512f") || flags.contains(&"avx512vl");
        profile.features.f16c = flags.contains(&"f16c");
        profile.features.fma = flags.contains(&"fma");
        profile.set_source("cpu_features", ProbeSource::Probed);
    } else {
        profile.set_source("cpu_features", ProbeSource::Unknown);
    }
}

pub(super) fn probe_gpu(profile: &mut HardwareProfile) {
    // NVIDIA first: nvidia-smi gives both identity and exact VRAM.
    if let Some(out) = run_probe(
        "nvidia-smi",
        &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
    ) {
        if let Some(line) = out.lines().next() {
            let mut parts = line.split(',');
            let name = parts.next().unwrap_or("").trim();
            let vram: u64 = parts
                .next()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if !name.is_empty() {
                profile.gpu_vendor = GpuVendor::Nvidia;
                profile.gpu_model = name.to_string();
                profile.gpu_vram_mb = vram;
                profile.set_source("gpu", ProbeSource::Probed);
                return;
            }
        }
    }

    // AMD: /dev/kfd is the kernel fusion driver required for ROCm.
    if Path::new("/dev/kfd").exists() {
        profile.gpu_vendor = GpuVendor::Amd;
        profile.gpu_model = lspci_model("amd")
            .or_else(|| lspci_model("radeon"))
            .unwrap_or_else(|| "AMD GPU".to_string());
        profile.gpu_vram_mb = rocm_vram_mb().unwrap_or(0);
        profile.set_source("gpu", ProbeSource::Probed);
        return;
    }

    // Anything else visible on the PCI bus.
    if let Some(out) = run_probe("lspci", &[]) {
        for line in out.lines() {
            if !(line.contains("VGA") || line.contains("3D controller")) {
                continue;
            }
            let model = line.split(": ").nth(1).unwrap_or(line).trim().to_string();
            let lower = line.to_lowercase();
            let vendor = if lower.contains("nvidia") {
                GpuVendor::Nvidia
            } else if lower.contains("amd") || lower.contains("ati") || lower.contains("radeon") {
                GpuVendor::Amd
            } else if lower.contains("intel") {
                GpuVendor::Intel
            } else {
                continue;
            };
            profile.gpu_vendor = vendor;
            profile.gpu_model = model;
            profile.set_source("gpu", ProbeSource::Probed);
            return;
        }
    }

    profile.set_source("gpu", ProbeSource::Unknown);
}

pub(super) fn probe_accel(profile: &mut HardwareProfile) {
    profile.accel.cuda = Path::new("/dev/nvidia0").exists()
        || run_probe("nvidia-smi", &["-L"]).is_some();
    profile.accel.rocm = Path::new("/dev/kfd").exists()
        && (run_probe("rocminfo", &[]).is_some() || run_probe("rocm-smi", &[]).is_some());
    profile.accel.vulkan = Path::new("/dev/dri/renderD128").exists()
        || run_probe("vulkaninfo", &["--summary"]).is_some();
    profile.accel.opencl = run_probe("clinfo", &["-l"]).is_some();
    profile.accel.metal = false;
    profile.set_source("accel", ProbeSource::Probed);
}

fn lspci_model(vendor: &str) -> Option<String> {
    let out = run_probe("lspci", &[])?;
    out.lines()
        .find(|l| {
            (l.contains("VGA") || l.contains("3D controller"))
                && l.to_lowercase().contains(vendor)
        })
        .map(|l| l.split(": ").nth(1).unwrap_or(l).trim().to_string())
}

/// Total VRAM from `rocm-smi --showmeminfo vram --csv` (reported in bytes).
fn rocm_vram_mb() -> Option<u64> {
    let out = run_probe("rocm-smi", &["--showmeminfo", "vram", "--csv"])?;
    for line in out.lines().skip(1) {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() >= 2 {
            if let Ok(bytes) = parts[1].trim().parse::<u64>() {
                return Some(bytes / (1024 * 1024));
            }
        }
    }
    None
}
