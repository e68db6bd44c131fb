//! Error taxonomy for the energy attribution core (§7).
//!
//! Kinds here are local-policy errors, not exceptions: the coordinator
//! never surfaces a backend error directly to a reader. Each tick's
//! degraded conditions are folded into [`crate::snapshot::DegradationSummary`]
//! instead; only [`EngineError::StaleSnapshot`] and
//! [`EngineError::ShutdownInProgress`] are ever returned to a caller
//! directly, from [`crate::coordinator::Coordinator`] read paths.

use thiserror::Error;

use crate::identity::ZoneName;

/// One entry in the error taxonomy of §7. Cheap to clone so a single
/// occurrence can be folded into both a log line and a snapshot's
/// degradation summary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("sensor unavailable: backend {backend} ({reason})")]
    SensorUnavailable { backend: String, reason: String },

    #[error("transient sensor read failure on {backend} (zone/device {target}): {reason}")]
    SensorTransient {
        backend: String,
        target: String,
        reason: String,
    },

    #[error("implausible wrap on zone {zone}: delta {delta} exceeds half of max_raw {max_raw}")]
    WrapImplausible {
        zone: ZoneName,
        delta: u64,
        max_raw: u64,
    },

    #[error("identity {identity} missing from counter source {source}")]
    IdentityMissing { identity: String, source: String },

    #[error("per-process utilization query unavailable on device {device_uuid}: {reason}")]
    UtilizationUnavailable { device_uuid: String, reason: String },

    #[error("snapshot is stale: age {age_secs}s exceeds threshold {threshold_secs}s")]
    StaleSnapshot { age_secs: u64, threshold_secs: u64 },

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

/// Coarse bucket an [`EngineError`] falls into for the per-snapshot
/// degradation-count summary (§7: "degraded-data conditions are expressed
/// as omissions in the snapshot plus a per-snapshot degradation summary").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    SensorUnavailable,
    SensorTransient,
    WrapImplausible,
    IdentityMissing,
    UtilizationUnavailable,
}

impl From<&EngineError> for Option<DegradationKind> {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::SensorUnavailable { .. } => Some(DegradationKind::SensorUnavailable),
            EngineError::SensorTransient { .. } => Some(DegradationKind::SensorTransient),
            EngineError::WrapImplausible { .. } => Some(DegradationKind::WrapImplausible),
            EngineError::IdentityMissing { .. } => Some(DegradationKind::IdentityMissing),
            EngineError::UtilizationUnavailable { .. } => {
                Some(DegradationKind::UtilizationUnavailable)
            }
            EngineError::StaleSnapshot { .. } | EngineError::ShutdownInProgress => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_facing_errors_have_no_degradation_bucket() {
        let stale = EngineError::StaleSnapshot {
            age_secs: 15,
            threshold_secs: 10,
        };
        let bucket: Option<DegradationKind> = (&stale).into();
        assert!(bucket.is_none());
    }

    #[test]
    fn backend_errors_map_to_a_degradation_bucket() {
        let err = EngineError::SensorTransient {
            backend: "gpu-nvml".into(),
            target: "device-1".into(),
            reason: "timeout".into(),
        };
        let bucket: Option<DegradationKind> = (&err).into();
        assert_eq!(bucket, Some(DegradationKind::SensorTransient));
    }
}
