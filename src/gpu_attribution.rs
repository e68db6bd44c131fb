//! GPU Attribution Engine (§4.4): per-device power split across
//! processes based on sharing mode and utilization, including
//! idle-baseline learning.

use std::collections::HashMap;

use tracing::warn;

use crate::backends::gpu::{GpuDeviceReading, GpuProcessUtilization};
use crate::sharing_mode::SharingMode;

/// Per-device idle-power learning state (§4.4). Owned by the writer
/// (coordinator) only; snapshots get an immutable copy of the derived
/// numbers, never a handle into this struct (§5, §9).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleBaseline {
    pub min_observed_power_uw: u64,
    pub idle_observed: bool,
}

impl IdleBaseline {
    /// Update on one tick's reading: a device reporting zero running
    /// compute processes teaches the learner its current power is idle.
    pub fn observe(&mut self, current_power_uw: u64, running_process_count: usize) {
        if running_process_count == 0 {
            self.min_observed_power_uw = current_power_uw;
            self.idle_observed = true;
        }
    }

    /// Resolve the idle baseline to use this tick: a configured override
    /// wins outright, then the learned minimum, then zero (§4.4).
    pub fn resolve(&self, configured_override_uw: Option<u64>) -> u64 {
        if let Some(fixed) = configured_override_uw {
            return fixed;
        }
        if self.idle_observed {
            self.min_observed_power_uw
        } else {
            0
        }
    }
}

/// Per-device idle-baseline map, keyed by device UUID so partitions
/// (which mint their own synthetic UUIDs) learn independently from their
/// parent device.
#[derive(Debug, Default)]
pub struct IdleBaselineTracker {
    baselines: HashMap<String, IdleBaseline>,
}

impl IdleBaselineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self, device_uuid: &str) -> IdleBaseline {
        self.baselines.get(device_uuid).copied().unwrap_or_default()
    }

    pub fn observe(&mut self, device_uuid: &str, current_power_uw: u64, running_process_count: usize) {
        self.baselines
            .entry(device_uuid.to_string())
            .or_default()
            .observe(current_power_uw, running_process_count);
    }
}

/// Energy (well, power) attributed to one pid on one device this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidPowerShare {
    pub pid: u32,
    pub power_uw: u64,
}

/// Full per-device attribution result for one tick.
#[derive(Debug, Clone)]
pub struct DeviceAttribution {
    pub device_uuid: String,
    pub total_power_uw: u64,
    pub idle_power_uw: u64,
    pub active_power_uw: u64,
    pub shares: Vec<PidPowerShare>,
}

/// Attribute one device's active power across its running processes for
/// one tick, per the mode-specific rules of §4.4. `utilization` should be
/// populated only when the backend's per-process utilization query
/// succeeded for this device this tick; an empty slice is treated
/// identically to a failed query (falls back to equal division in
/// time-slicing mode).
pub fn attribute_device(
    reading: &GpuDeviceReading,
    mode: SharingMode,
    idle_baseline: &IdleBaseline,
    configured_idle_override_uw: Option<u64>,
    utilization: &[GpuProcessUtilization],
) -> DeviceAttribution {
    // Clamped to total power: idle_power <= total_power must hold even
    // when a learned (or configured) baseline is stale relative to a
    // lower reading this tick (§8 invariant 4).
    let idle_power_uw = idle_baseline
        .resolve(configured_idle_override_uw)
        .min(reading.total_power_uw);
    let active_power_uw = reading.total_power_uw - idle_power_uw;

    let pids: Vec<u32> = reading.running_processes.iter().map(|p| p.pid).collect();

    let shares = match mode.for_attribution() {
        SharingMode::Exclusive => attribute_exclusive(active_power_uw, &pids),
        SharingMode::TimeSlicing => attribute_time_sliced(active_power_uw, &pids, utilization),
        SharingMode::Partitioned => {
            // A partition reading recurses using its own mode; by the
            // time we get here `mode` has already been resolved for this
            // specific (possibly partition) device by the caller, so
            // Partitioned only appears here if a partition itself reports
            // no sub-mode, treated as equal division (§4.4, §9 open
            // question resolution).
            attribute_equal_division(active_power_uw, &pids)
        }
        SharingMode::Unknown => unreachable!("for_attribution() never returns Unknown"),
    };

    DeviceAttribution {
        device_uuid: reading.device_uuid.clone(),
        total_power_uw: reading.total_power_uw,
        idle_power_uw,
        active_power_uw,
        shares,
    }
}

fn attribute_exclusive(active_power_uw: u64, pids: &[u32]) -> Vec<PidPowerShare> {
    if pids.len() > 1 {
        warn!(
            count = pids.len(),
            "multiple compute-running pids reported in exclusive mode; over-attributing to each"
        );
    }
    pids.iter()
        .map(|&pid| PidPowerShare {
            pid,
            power_uw: active_power_uw,
        })
        .collect()
}

fn attribute_time_sliced(
    active_power_uw: u64,
    pids: &[u32],
    utilization: &[GpuProcessUtilization],
) -> Vec<PidPowerShare> {
    let util_by_pid: HashMap<u32, f64> = utilization
        .iter()
        .filter(|u| pids.contains(&u.pid))
        .map(|u| (u.pid, u.compute_util_percent))
        .collect();

    let total_util: f64 = util_by_pid.values().sum();

    if util_by_pid.is_empty() || total_util <= 0.0 {
        return attribute_equal_division(active_power_uw, pids);
    }

    pids.iter()
        .map(|&pid| {
            let util = util_by_pid.get(&pid).copied().unwrap_or(0.0);
            let power_uw = ((active_power_uw as f64) * util / total_util).round() as u64;
            PidPowerShare { pid, power_uw }
        })
        .collect()
}

fn attribute_equal_division(active_power_uw: u64, pids: &[u32]) -> Vec<PidPowerShare> {
    if pids.is_empty() {
        return Vec::new();
    }
    let share = active_power_uw / pids.len() as u64;
    pids.iter()
        .map(|&pid| PidPowerShare {
            pid,
            power_uw: share,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::gpu::{ComputeModeFlag, RunningProcess};
    use crate::identity::GpuVendor;

    fn reading(total_power_uw: u64, pids: &[u32]) -> GpuDeviceReading {
        GpuDeviceReading {
            device_index: 0,
            device_uuid: "gpu-0".into(),
            name: "test".into(),
            vendor: GpuVendor::Nvidia,
            total_power_uw,
            total_energy_uj: None,
            running_processes: pids
                .iter()
                .map(|&pid| RunningProcess {
                    pid,
                    memory_used_bytes: 0,
                })
                .collect(),
            compute_mode: ComputeModeFlag::ExclusiveProcess,
            partitioning_enabled: false,
            parent_device_id: None,
            partition_size_ratio: 1.0,
        }
    }

    #[test]
    fn exclusive_mode_attributes_all_active_power_to_sole_pid() {
        let r = reading(150_000_000, &[42]);
        let idle = IdleBaseline::default();
        let attr = attribute_device(&r, SharingMode::Exclusive, &idle, None, &[]);
        assert_eq!(attr.idle_power_uw, 0);
        assert_eq!(attr.active_power_uw, 150_000_000);
        assert_eq!(attr.shares, vec![PidPowerShare { pid: 42, power_uw: 150_000_000 }]);
    }

    #[test]
    fn time_sliced_splits_by_utilization_ratio() {
        let r = reading(80_000_000, &[1, 2]);
        let mut idle = IdleBaseline::default();
        idle.min_observed_power_uw = 40_000_000;
        idle.idle_observed = true;
        let mut total_reading = r.clone();
        total_reading.total_power_uw = 120_000_000;
        let util = vec![
            GpuProcessUtilization {
                pid: 1,
                compute_util_percent: 60.0,
                memory_util_percent: 0.0,
                encoder_util_percent: 0.0,
                decoder_util_percent: 0.0,
                sample_timestamp_ns: 0,
            },
            GpuProcessUtilization {
                pid: 2,
                compute_util_percent: 20.0,
                memory_util_percent: 0.0,
                encoder_util_percent: 0.0,
                decoder_util_percent: 0.0,
                sample_timestamp_ns: 0,
            },
        ];
        let attr = attribute_device(&total_reading, SharingMode::TimeSlicing, &idle, None, &util);
        assert_eq!(attr.active_power_uw, 80_000_000);
        let pid1 = attr.shares.iter().find(|s| s.pid == 1).unwrap();
        let pid2 = attr.shares.iter().find(|s| s.pid == 2).unwrap();
        assert_eq!(pid1.power_uw, 60_000_000);
        assert_eq!(pid2.power_uw, 20_000_000);
    }

    #[test]
    fn time_sliced_falls_back_to_equal_division_when_utilization_query_fails() {
        let mut r = reading(120_000_000, &[1, 2]);
        r.total_power_uw = 120_000_000;
        let mut idle = IdleBaseline::default();
        idle.min_observed_power_uw = 40_000_000;
        idle.idle_observed = true;
        let attr = attribute_device(&r, SharingMode::TimeSlicing, &idle, None, &[]);
        assert_eq!(attr.active_power_uw, 80_000_000);
        for share in &attr.shares {
            assert_eq!(share.power_uw, 40_000_000);
        }
    }

    #[test]
    fn idle_baseline_override_suppresses_learning() {
        let mut idle = IdleBaseline::default();
        idle.observe(10_000, 0);
        assert_eq!(idle.resolve(Some(999)), 999);
    }

    #[test]
    fn idle_never_exceeds_total_power() {
        let mut idle = IdleBaseline::default();
        idle.observe(200_000_000, 0);
        let r = reading(50_000_000, &[7]);
        let attr = attribute_device(&r, SharingMode::Exclusive, &idle, None, &[]);
        assert!(attr.idle_power_uw <= attr.total_power_uw);
        assert_eq!(attr.active_power_uw, 0);
    }

    #[test]
    fn no_running_processes_yields_no_shares() {
        let r = reading(50_000_000, &[]);
        let idle = IdleBaseline::default();
        let attr = attribute_device(&r, SharingMode::Exclusive, &idle, None, &[]);
        assert!(attr.shares.is_empty());
    }
}
