//! Stub probes for platforms without a dedicated implementation. Every
//! field keeps its sentinel, tagged as unknown.

use crate::profile::{HardwareProfile, ProbeSource};

pub(super) fn probe_cpu(profile: &mut HardwareProfile) {
    profile.set_source("cpu", ProbeSource::Unknown);
    profile.set_source("cpu_features", ProbeSource::Unknown);
}

pub(super) fn probe_gpu(profile: &mut HardwareProfile) {
    profile.set_source("gpu", ProbeSource::Unknown);
}

pub(super) fn probe_accel(profile: &mut HardwareProfile) {
    profile.set_source("accel", ProbeSource::Unknown);
}
