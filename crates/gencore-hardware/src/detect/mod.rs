//! Hardware probing.
//!
//! [`probe`] assembles a [`HardwareProfile`] from isolated sub-probes:
//! memory and core counts via `sysinfo`, CPU identity and SIMD features,
//! GPU presence and VRAM, and acceleration-API availability via
//! platform-specific commands and device nodes. A failing sub-probe logs
//! at `warn` and leaves its sentinel (`GpuVendor::None`, `gpu_vram_mb = 0`,
//! `cpu_model = "Unknown"`) tagged [`ProbeSource::Unknown`]; it never
//! prevents the other probes from running.
//!
//! When direct GPU probing finds nothing, the pure identity-string
//! fallback in [`identity`] may fill in a guess, tagged
//! [`ProbeSource::Fallback`].

pub mod identity;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
use windows as platform;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as platform;

#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
mod unsupported;
#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
use unsupported as platform;

use crate::profile::{GpuVendor, HardwareProfile, ProbeSource};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::info;

/// Probe the current machine. Runs synchronously — call from a blocking
/// context or `spawn_blocking`.
pub fn probe() -> HardwareProfile {
    let mut profile = HardwareProfile::default();

    probe_memory(&mut profile);
    probe_cores(&mut profile);
    platform::probe_cpu(&mut profile);
    platform::probe_gpu(&mut profile);
    platform::probe_accel(&mut profile);

    if profile.gpu_vendor == GpuVendor::None {
        identity::apply_fallback(&mut profile);
    }

    if profile.cpu_ghz == 0.0 {
        if let Some(ghz) = parse_ghz(&profile.cpu_model) {
            profile.cpu_ghz = ghz;
        }
    }

    info!(
        cpu = %profile.cpu_model,
        cores = profile.cpu_cores,
        threads = profile.cpu_threads,
        ram_mb = profile.total_ram_mb,
        gpu = %profile.gpu_vendor,
        gpu_model = %profile.gpu_model,
        vram_mb = profile.gpu_vram_mb,
        "hardware probe complete"
    );
    profile
}

fn probe_memory(profile: &mut HardwareProfile) {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    let total = sys.total_memory();
    if total > 0 {
        profile.total_ram_mb = total / (1024 * 1024);
        profile.set_source("memory", ProbeSource::Probed);
    } else {
        profile.set_source("memory", ProbeSource::Unknown);
    }
}

fn probe_cores(profile: &mut HardwareProfile) {
    let logical = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let sys =
        System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
    // available_parallelism respects cgroup quotas; never report more
    // physical cores than the process may actually schedule on.
    let physical = sys.physical_core_count().unwrap_or(logical).min(logical);

    profile.cpu_threads = logical as u32;
    profile.cpu_cores = physical.max(1) as u32;
}

/// Extract the nominal frequency from identity strings like
/// `Intel(R) Core(TM) i9-11900KF @ 3.50GHz`.
pub(crate) fn parse_ghz(cpu_model: &str) -> Option<f64> {
    let after_at = cpu_model.split('@').nth(1)?;
    let ghz_part = after_at.split("GHz").next()?.trim();
    ghz_part.parse::<f64>().ok()
}

/// Run an external probe command, returning stdout on success.
#[allow(dead_code)]
pub(crate) fn run_probe(cmd: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(cmd).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_memory_and_cores() {
        let profile = probe();
        assert!(profile.total_ram_mb > 0, "total RAM must be probed");
        assert!(profile.cpu_cores >= 1);
        assert!(profile.cpu_threads >= profile.cpu_cores);
    }

    #[test]
    fn test_probe_never_panics_and_tags_sources() {
        let profile = probe();
        assert!(profile.sources.contains_key("memory"));
    }

    #[test]
    fn test_parse_ghz_from_intel_identity() {
        assert_eq!(
            parse_ghz("Intel(R) Core(TM) i9-11900KF @ 3.50GHz"),
            Some(3.5)
        );
    }

    #[test]
    fn test_parse_ghz_absent() {
        assert_eq!(parse_ghz("AMD Ryzen 9 5950X 16-Core Processor"), None);
        assert_eq!(parse_ghz("Unknown"), None);
    }

    #[test]
    fn test_gpu_sentinels_when_not_detected() {
        // Whatever the machine, a profile with vendor None must keep the
        // documented sentinels.
        let profile = probe();
        if profile.gpu_vendor == GpuVendor::None {
            assert_eq!(profile.gpu_vram_mb, 0);
        }
    }
}
