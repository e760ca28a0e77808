//! Windows probes: PowerShell CIM queries plus driver-file checks.

use super::run_probe;
use crate::profile::{GpuVendor, HardwareProfile, ProbeSource};
use std::path::{Path, PathBuf};
use tracing::warn;

fn powershell(command: &str) -> Option<String> {
    run_probe("powershell", &["-NoProfile", "-Command", command])
}

pub(super) fn probe_cpu(profile: &mut HardwareProfile) {
    match powershell("(Get-CimInstance Win32_Processor).Name") {
        Some(out) if !out.trim().is_empty() => {
            profile.cpu_model = out.trim().to_string();
            profile.set_source("cpu", ProbeSource::Probed);
        }
        _ => {
            warn!("Win32_Processor query failed");
            profile.set_source("cpu", ProbeSource::Unknown);
        }
    }
    // Win32_ProcessorFeature is unreliable across Windows versions; SIMD
    // flags come from the identity fallback instead.
    profile.set_source("cpu_features", ProbeSource::Unknown);
}

pub(super) fn probe_gpu(profile: &mut HardwareProfile) {
    let out = match powershell(
        "Get-CimInstance Win32_VideoController | ForEach-Object { $_.Name + '|' + $_.AdapterRAM }",
    ) {
        Some(out) => out,
        None => {
            warn!("Win32_VideoController query failed");
            profile.set_source("gpu", ProbeSource::Unknown);
            return;
        }
    };

    // Prefer discrete adapters over integrated ones.
    let mut best: Option<(GpuVendor, String, u64)> = None;
    for line in out.lines() {
        let mut parts = line.splitn(2, '|');
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let vram_mb = parts
            .next()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|bytes| bytes / (1024 * 1024))
            .unwrap_or(0);
        let vendor = if name.contains("NVIDIA") {
            GpuVendor::Nvidia
        } else if name.contains("AMD") || name.contains("Radeon") {
            GpuVendor::Amd
        } else if name.contains("Intel") {
            GpuVendor::Intel
        } else {
            continue;
        };
        let discrete = matches!(vendor, GpuVendor::Nvidia | GpuVendor::Amd);
        let replace = match &best {
            None => true,
            Some((current, _, _)) => {
                discrete && !matches!(current, GpuVendor::Nvidia | GpuVendor::Amd)
            }
        };
        if replace {
            best = Some((vendor, name.to_string(), vram_mb));
        }
    }

    match best {
        Some((vendor, name, vram_mb)) => {
            profile.gpu_vendor = vendor;
            profile.gpu_model = name;
            profile.gpu_vram_mb = vram_mb;
            profile.set_source("gpu", ProbeSource::Probed);
        }
        None => profile.set_source("gpu", ProbeSource::Unknown),
    }
}

pub(super) fn probe_accel(profile: &mut HardwareProfile) {
    let system32 = PathBuf::from(std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".into()))
        .join("System32");

    profile.accel.cuda =
        run_probe("where", &["nvcc"]).is_some() || system32.join("nvcuda.dll").exists();

    let rocm_dir = Path::new("C:\\Program Files\\AMD\\ROCm");
    profile.accel.rocm = rocm_dir.exists();
    profile.accel.opencl = system32.join("amdocl.dll").exists()
        || system32.join("OpenCL.dll").exists();
    profile.accel.vulkan = run_probe("vulkaninfo", &["--summary"]).is_some()
        || system32.join("vulkan-1.dll").exists();
    profile.accel.metal = false;
    profile.set_source("accel", ProbeSource::Probed);
}
