//! The GPU backend (§4.1): per-device power/energy, running-process
//! list, and optional per-process utilization, plus the compute-mode and
//! partition-mode flags the Sharing-Mode Detector (§4.3) consumes.

use async_trait::async_trait;

use super::GpuBackendFactory;
use crate::error::EngineError;

/// A single compute-running process reported by a GPU device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub memory_used_bytes: u64,
}

/// Per-process utilization sample (§4.1), when the vendor SDK supports
/// the query; not every vendor/driver combination does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuProcessUtilization {
    pub pid: u32,
    pub compute_util_percent: f64,
    pub memory_util_percent: f64,
    pub encoder_util_percent: f64,
    pub decoder_util_percent: f64,
    pub sample_timestamp_ns: u64,
}

/// Raw compute-mode flag a vendor SDK reports, consumed by the
/// Sharing-Mode Detector (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeModeFlag {
    Default,
    ExclusiveProcess,
    ExclusiveThread,
    Prohibited,
}

/// One device's full reading for a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDeviceReading {
    pub device_index: u32,
    pub device_uuid: String,
    pub name: String,
    pub vendor: crate::identity::GpuVendor,
    pub total_power_uw: u64,
    pub total_energy_uj: Option<u64>,
    pub running_processes: Vec<RunningProcess>,
    pub compute_mode: ComputeModeFlag,
    pub partitioning_enabled: bool,
    /// Set when this reading represents a partition/slice of a physical
    /// device rather than the whole device (§3 GPU Device).
    pub parent_device_id: Option<String>,
    pub partition_size_ratio: f64,
}

/// Capability set {initialize, enumerate devices, sample, shutdown} for a
/// GPU power backend (§4.1). The device set is frozen at probe time;
/// hot-plug is explicitly unsupported (§3 GPU Device lifecycle).
#[async_trait]
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Devices known since probe; stable for the backend's lifetime.
    fn device_count(&self) -> usize;

    /// Read a fresh value for every known device. A device backend may
    /// omit an individual device from the returned vector on transient
    /// failure (§7 `SensorTransient`) rather than failing the whole call.
    async fn sample(&mut self) -> Result<Vec<GpuDeviceReading>, EngineError>;

    /// Per-process utilization query for one device, when supported.
    /// Returns `Err(UtilizationUnavailable)` for vendors/drivers that
    /// cannot answer it; callers fall back to equal division (§4.4).
    async fn process_utilization(
        &mut self,
        device_uuid: &str,
    ) -> Result<Vec<GpuProcessUtilization>, EngineError>;

    async fn shutdown(&mut self) {}
}

/// A zero-device GPU backend: the default when no vendor SDK is linked
/// in. Always probes to `Ok(None)` so the registry drops it silently
/// (§4.1) rather than ever claiming a device exists.
#[derive(Debug, Default)]
pub struct NullGpuBackend;

#[async_trait]
impl GpuBackend for NullGpuBackend {
    fn name(&self) -> &str {
        "gpu-null"
    }

    fn device_count(&self) -> usize {
        0
    }

    async fn sample(&mut self) -> Result<Vec<GpuDeviceReading>, EngineError> {
        Ok(Vec::new())
    }

    async fn process_utilization(
        &mut self,
        device_uuid: &str,
    ) -> Result<Vec<GpuProcessUtilization>, EngineError> {
        Err(EngineError::UtilizationUnavailable {
            device_uuid: device_uuid.to_string(),
            reason: "null backend has no devices".into(),
        })
    }
}

/// Factory for [`NullGpuBackend`]. Always probes to `Ok(None)` so the
/// registry drops it rather than publishing a phantom zero-device backend.
#[derive(Debug, Default)]
pub struct NullGpuBackendFactory;

#[async_trait]
impl GpuBackendFactory for NullGpuBackendFactory {
    async fn probe(&self) -> Result<Option<Box<dyn GpuBackend>>, EngineError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_backend_reports_zero_devices() {
        let mut backend = NullGpuBackend;
        assert_eq!(backend.device_count(), 0);
        let readings = backend.sample().await.unwrap();
        assert!(readings.is_empty());
    }

    #[tokio::test]
    async fn null_backend_utilization_is_unavailable() {
        let mut backend = NullGpuBackend;
        let result = backend.process_utilization("gpu-0").await;
        assert!(matches!(
            result,
            Err(EngineError::UtilizationUnavailable { .. })
        ));
    }
}
