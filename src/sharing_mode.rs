//! Sharing-Mode Detector (§4.3): classifies each GPU's sharing mode at
//! startup and on explicit refresh. Modes are cached and re-read only on
//! refresh; a mode change between refreshes is never observed mid-tick.

use std::collections::HashMap;

use crate::backends::gpu::{ComputeModeFlag, GpuDeviceReading};

/// How a GPU is shared among processes (§4.3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    Exclusive,
    TimeSlicing,
    Partitioned,
    Unknown,
}

impl SharingMode {
    /// Unknown mode is treated as time-slicing for attribution purposes
    /// (§4.3, §4.4). This is the single place that equivalence lives so
    /// every caller stays in sync.
    pub fn for_attribution(self) -> SharingMode {
        match self {
            SharingMode::Unknown => SharingMode::TimeSlicing,
            other => other,
        }
    }
}

/// Classify one device reading into a sharing mode (§4.3 decision order:
/// partitioned > exclusive > time-slicing, with unknown reserved for
/// detection errors rather than an ordinary fallthrough state).
pub fn classify(reading: &GpuDeviceReading) -> SharingMode {
    if reading.partitioning_enabled {
        return SharingMode::Partitioned;
    }
    match reading.compute_mode {
        ComputeModeFlag::ExclusiveProcess | ComputeModeFlag::ExclusiveThread => {
            SharingMode::Exclusive
        }
        ComputeModeFlag::Default | ComputeModeFlag::Prohibited => SharingMode::TimeSlicing,
    }
}

/// Per-device cache of the last-detected sharing mode, refreshed only
/// when [`SharingModeDetector::refresh`] is called (§4.3).
#[derive(Debug, Default)]
pub struct SharingModeDetector {
    modes: HashMap<String, SharingMode>,
}

impl SharingModeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read sharing mode for every device in `readings`, logging a
    /// degradation when detection fails for a device (callers pass
    /// `None` compute-mode information as a detection error by omitting
    /// the device from `readings`, keeping the previously cached mode.
    /// or `Unknown` if none was ever cached).
    pub fn refresh(&mut self, readings: &[GpuDeviceReading]) {
        for reading in readings {
            let mode = classify(reading);
            self.modes.insert(reading.device_uuid.clone(), mode);
        }
    }

    /// The cached mode for a device, or `Unknown` if it has never been
    /// successfully detected (§4.3 "on any error during detection, mode
    /// is unknown").
    pub fn mode(&self, device_uuid: &str) -> SharingMode {
        self.modes.get(device_uuid).copied().unwrap_or(SharingMode::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::GpuVendor;

    fn device(uuid: &str, partitioned: bool, mode: ComputeModeFlag) -> GpuDeviceReading {
        GpuDeviceReading {
            device_index: 0,
            device_uuid: uuid.to_string(),
            name: "test-gpu".into(),
            vendor: GpuVendor::Nvidia,
            total_power_uw: 0,
            total_energy_uj: None,
            running_processes: vec![],
            compute_mode: mode,
            partitioning_enabled: partitioned,
            parent_device_id: None,
            partition_size_ratio: 1.0,
        }
    }

    #[test]
    fn partitioning_takes_precedence_over_compute_mode() {
        let d = device("gpu-0", true, ComputeModeFlag::ExclusiveProcess);
        assert_eq!(classify(&d), SharingMode::Partitioned);
    }

    #[test]
    fn exclusive_process_mode_classifies_as_exclusive() {
        let d = device("gpu-0", false, ComputeModeFlag::ExclusiveProcess);
        assert_eq!(classify(&d), SharingMode::Exclusive);
    }

    #[test]
    fn default_compute_mode_classifies_as_time_slicing() {
        let d = device("gpu-0", false, ComputeModeFlag::Default);
        assert_eq!(classify(&d), SharingMode::TimeSlicing);
    }

    #[test]
    fn unknown_mode_is_treated_as_time_slicing_for_attribution() {
        assert_eq!(
            SharingMode::Unknown.for_attribution(),
            SharingMode::TimeSlicing
        );
    }

    #[test]
    fn unrefreshed_device_reports_unknown() {
        let detector = SharingModeDetector::new();
        assert_eq!(detector.mode("never-seen"), SharingMode::Unknown);
    }

    #[test]
    fn refresh_caches_until_next_refresh() {
        let mut detector = SharingModeDetector::new();
        let d = device("gpu-0", false, ComputeModeFlag::ExclusiveProcess);
        detector.refresh(&[d]);
        assert_eq!(detector.mode("gpu-0"), SharingMode::Exclusive);

        // A refresh that omits the device keeps the cached mode rather
        // than reverting to Unknown mid-tick.
        detector.refresh(&[]);
        assert_eq!(detector.mode("gpu-0"), SharingMode::Exclusive);
    }
}
