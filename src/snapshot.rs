//! The Node Snapshot data contract (§3, §6). The single published
//! artifact exporters read. Immutable once constructed: every field is
//! owned data, not a handle into writer-side state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DegradationKind;
use crate::identity::{ProcessIdentity, ZoneName};

/// Per-zone energy totals published for one tick (§6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneEnergy {
    pub absolute_uj: u64,
    pub idle_uj: u64,
    pub dynamic_uj: u64,
    pub delta_this_tick_uj: u64,
}

/// Per-GPU power/energy totals published for one tick (§6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuEnergy {
    pub total_power_uw: u64,
    pub idle_power_uw: u64,
    pub active_power_uw: u64,
    pub absolute_energy_uj: u64,
}

/// Per-zone idle/dynamic energy attributed to a single process for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessZoneEnergy {
    pub idle_uj: u64,
    pub dynamic_uj: u64,
}

/// Everything published about one process in one snapshot (§6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessEnergy {
    pub per_zone: HashMap<ZoneName, ProcessZoneEnergy>,
    pub gpu_uj: u64,
    pub container_id: Option<String>,
    pub pod_id: Option<String>,
    pub vm_id: Option<String>,
}

/// An aggregate over a set of processes sharing a foreign key
/// (container, pod, or vm), identically shaped to `ProcessEnergy` minus
/// the foreign keys (§3 "Workload Aggregate").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadEnergy {
    pub per_zone: HashMap<ZoneName, ProcessZoneEnergy>,
    pub gpu_uj: u64,
    /// True once the workload's last process has terminated; retained
    /// during the tombstone interval so its terminal tick is still billed.
    pub terminated: bool,
}

/// Count of [`DegradationKind`] occurrences folded into one snapshot,
/// replacing the raw backend errors that are never surfaced to readers (§7).
pub type DegradationSummary = HashMap<DegradationKind, u32>;

/// The immutable, sequence-numbered artifact published once per tick (§3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub wall_time: chrono::DateTime<chrono::Utc>,
    pub monotonic_time_ns: u64,
    pub published_at_ns: u64,

    pub zones: HashMap<ZoneName, ZoneEnergy>,
    pub gpus: HashMap<String, GpuEnergy>,

    pub processes: HashMap<ProcessIdentity, ProcessEnergy>,
    pub containers: HashMap<String, WorkloadEnergy>,
    pub pods: HashMap<String, WorkloadEnergy>,
    pub vms: HashMap<String, WorkloadEnergy>,

    /// Residual dynamic energy per zone not attributable to any live
    /// process or workload this tick (§3, §4.6, §8 invariant 2).
    pub unattributed_dynamic_uj: HashMap<ZoneName, u64>,

    pub degradation: DegradationSummary,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            sequence: 0,
            wall_time: chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0)
                .expect("epoch timestamp is always valid"),
            monotonic_time_ns: 0,
            published_at_ns: 0,
            zones: HashMap::new(),
            gpus: HashMap::new(),
            processes: HashMap::new(),
            containers: HashMap::new(),
            pods: HashMap::new(),
            vms: HashMap::new(),
            unattributed_dynamic_uj: HashMap::new(),
            degradation: DegradationSummary::new(),
        }
    }
}

impl Snapshot {
    /// Age of this snapshot relative to `now_ns`, clamped to zero if the
    /// clock somehow moved backwards between capture and read.
    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.published_at_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_equals_idle_plus_dynamic_invariant_is_representable() {
        let z = ZoneEnergy {
            absolute_uj: 100,
            idle_uj: 40,
            dynamic_uj: 60,
            delta_this_tick_uj: 10,
        };
        assert_eq!(z.absolute_uj, z.idle_uj + z.dynamic_uj);
    }

    #[test]
    fn snapshot_age_never_underflows() {
        let snap = Snapshot {
            published_at_ns: 1_000,
            ..Default::default()
        };
        assert_eq!(snap.age_ns(500), 0);
        assert_eq!(snap.age_ns(1_500), 500);
    }

    #[test]
    fn snapshot_round_trips_through_json_with_string_process_keys() {
        let identity = ProcessIdentity::new(42, 1_700_000_000_000_000);
        let mut processes = HashMap::new();
        processes.insert(
            identity,
            ProcessEnergy {
                gpu_uj: 123,
                ..Default::default()
            },
        );
        let snap = Snapshot {
            sequence: 7,
            processes,
            ..Default::default()
        };

        let encoded = serde_json::to_string(&snap).expect("snapshot must be JSON-encodable");
        // Process identity serializes as the `pid@start_time_ns` wire form
        // (§6), not as a nested object, since JSON object keys must be strings.
        assert!(encoded.contains("\"42@1700000000000000\""));

        let decoded: Snapshot = serde_json::from_str(&encoded).expect("snapshot must round-trip");
        assert_eq!(decoded, snap);
    }
}
