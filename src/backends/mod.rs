//! Sensor Backends (§4.1): vendor-abstracted readers for CPU energy zones
//! and GPU power/energy/process telemetry.
//!
//! Backends are pluggable via constructor-time assembly rather than a
//! process-wide mutable registry (§9 "Dynamic dispatch of backends"); a
//! [`BackendRegistry`] is built once at startup from a `Vec` of boxed
//! backend factories, probed, and anything that fails to initialize or
//! reports zero devices is silently dropped.

pub mod cpu;
pub mod gpu;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

pub use cpu::{CpuBackend, EnergyZoneReading};
pub use gpu::{GpuBackend, GpuDeviceReading, GpuProcessUtilization, RunningProcess};

use crate::error::EngineError;

/// Default per-backend per-tick read timeout (§5), overridden by
/// [`crate::config::Config::backend_timeout_ms`].
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(2);

/// A CPU backend factory: attempts to construct and initialize a
/// [`CpuBackend`], returning `Ok(None)` (not an error) if the backend
/// genuinely has nothing to offer on this host (e.g. no `powercap` tree).
#[async_trait]
pub trait CpuBackendFactory: Send + Sync {
    async fn probe(&self) -> Result<Option<Box<dyn CpuBackend>>, EngineError>;
}

/// A GPU backend factory, symmetric to [`CpuBackendFactory`].
#[async_trait]
pub trait GpuBackendFactory: Send + Sync {
    async fn probe(&self) -> Result<Option<Box<dyn GpuBackend>>, EngineError>;
}

/// The assembled, post-probe set of live backends for this process's
/// lifetime. GPU device enumeration is frozen once probed; hot-plug is
/// explicitly unsupported (§3 GPU Device lifecycle).
pub struct BackendRegistry {
    pub cpu_backends: Vec<Box<dyn CpuBackend>>,
    pub gpu_backends: Vec<Box<dyn GpuBackend>>,
}

impl BackendRegistry {
    /// Probe every registered factory, keeping only backends that
    /// initialize successfully and report at least one device/zone.
    /// Returns [`EngineError::SensorUnavailable`] only when *no* backend
    /// of either kind survives probing (§7: fatal startup condition).
    pub async fn assemble(
        cpu_factories: Vec<Box<dyn CpuBackendFactory>>,
        gpu_factories: Vec<Box<dyn GpuBackendFactory>>,
    ) -> Result<Self, EngineError> {
        let mut cpu_backends = Vec::new();
        for factory in cpu_factories {
            match factory.probe().await {
                Ok(Some(backend)) => {
                    info!(backend = backend.name(), "cpu backend initialized");
                    cpu_backends.push(backend);
                }
                Ok(None) => {
                    info!("cpu backend reported zero zones, dropping");
                }
                Err(err) => {
                    warn!(error = %err, "cpu backend failed to initialize, dropping");
                }
            }
        }

        let mut gpu_backends = Vec::new();
        for factory in gpu_factories {
            match factory.probe().await {
                Ok(Some(backend)) => {
                    info!(backend = backend.name(), "gpu backend initialized");
                    gpu_backends.push(backend);
                }
                Ok(None) => {
                    info!("gpu backend reported zero devices, dropping");
                }
                Err(err) => {
                    warn!(error = %err, "gpu backend failed to initialize, dropping");
                }
            }
        }

        if cpu_backends.is_empty() && gpu_backends.is_empty() {
            return Err(EngineError::SensorUnavailable {
                backend: "*".into(),
                reason: "no backend of any kind could be initialized".into(),
            });
        }

        Ok(Self {
            cpu_backends,
            gpu_backends,
        })
    }
}
