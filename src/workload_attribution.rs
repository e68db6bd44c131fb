//! Workload Attribution Engine (§4.6): splits node dynamic energy across
//! live processes by a configurable resource-usage ratio per zone, and
//! rolls per-process energy up into container/pod/vm aggregates while
//! preserving a terminated workload's terminal-tick tail.

use std::collections::HashMap;

use crate::config::UsageMetricChoice;
use crate::identity::{MetricKey, ProcessIdentity, ZoneName};
use crate::snapshot::{ProcessZoneEnergy, WorkloadEnergy};
use crate::tracker::ProcessCounters;

/// One process's computed zone-energy share for this tick, plus enough
/// context to roll it up into container/pod/vm aggregates.
#[derive(Debug, Clone)]
pub struct ProcessShare {
    pub identity: ProcessIdentity,
    pub container_id: Option<String>,
    pub pod_id: Option<String>,
    pub vm_id: Option<String>,
    pub idle_uj: u64,
    pub dynamic_uj: u64,
}

/// Result of splitting one zone's dynamic energy across all live
/// processes for one tick (§4.6 steps 2–4).
#[derive(Debug, Clone, Default)]
pub struct ZoneAttribution {
    pub shares: Vec<ProcessShare>,
    pub unattributed_dynamic_uj: u64,
}

/// Split one zone's node-level dynamic (and, when exposed, idle) energy
/// across the given live processes.
///
/// `idle_uj` is `Some` only when idle exposure applies (single-tenant, or
/// multi-tenant-opaque disabled); see `expose_idle`/`multi_tenant_opaque`
/// in [`crate::config::Config`]; idle is always divided evenly, dynamic
/// follows the configured usage metric (§4.6 step 1, 3).
pub fn attribute_zone(
    zone: ZoneName,
    dynamic_uj: u64,
    idle_uj: Option<u64>,
    metric_choice: UsageMetricChoice,
    live_processes: &[&ProcessCounters],
) -> ZoneAttribution {
    let n = live_processes.len();
    if n == 0 {
        return ZoneAttribution {
            shares: Vec::new(),
            unattributed_dynamic_uj: dynamic_uj,
        };
    }

    let metric: Option<MetricKey> = match metric_choice {
        UsageMetricChoice::Metric(m) => Some(m),
        UsageMetricChoice::EvenSplit => None,
    };

    // Effective metric per §4.6 step 1 fallbacks: package/core fall back
    // to cpu time, dram falls back to cpu time, when the chosen metric
    // has zero total usage across all live processes.
    let usage = |proc: &ProcessCounters, key: MetricKey| -> u64 {
        proc.counters.get(&key).map(|c| c.delta).unwrap_or(0)
    };

    let total_with = |key: MetricKey| -> u64 {
        live_processes.iter().map(|p| usage(p, key)).sum()
    };

    let (chosen_metric, total_usage) = match metric {
        Some(m) => {
            let total = total_with(m);
            if total > 0 {
                (Some(m), total)
            } else if matches!(zone, ZoneName::Package | ZoneName::Core | ZoneName::Dram)
                && m != MetricKey::CpuTime
            {
                let fallback_total = total_with(MetricKey::CpuTime);
                (Some(MetricKey::CpuTime), fallback_total)
            } else {
                (Some(m), 0)
            }
        }
        None => (None, 0),
    };

    let mut shares = Vec::with_capacity(n);
    let even_idle_share = idle_uj.map(|v| v / n as u64);

    let mut attributed_dynamic_sum: u64 = 0;

    for proc in live_processes {
        let dynamic_share = match chosen_metric {
            Some(key) if total_usage > 0 => {
                let u = usage(proc, key);
                ((dynamic_uj as u128) * (u as u128) / (total_usage as u128)) as u64
            }
            _ => dynamic_uj / n as u64,
        };
        attributed_dynamic_sum += dynamic_share;

        shares.push(ProcessShare {
            identity: proc.identity,
            container_id: proc.container_id.clone(),
            pod_id: proc.pod_id.clone(),
            vm_id: proc.vm_id.clone(),
            idle_uj: even_idle_share.unwrap_or(0),
            dynamic_uj: dynamic_share,
        });
    }

    let unattributed_dynamic_uj = dynamic_uj.saturating_sub(attributed_dynamic_sum);

    ZoneAttribution {
        shares,
        unattributed_dynamic_uj,
    }
}

/// Roll a tick's per-process zone shares (plus per-process GPU energy)
/// into container/pod/vm aggregates. Workloads whose last process has
/// terminated this tick are still included (`terminated: true`) so their
/// terminal tail is billed (§3 "Workload Aggregate", §4.6 end-to-end
/// scenario 4); eviction of the aggregate itself is the tracker's job via
/// the tombstone interval, not this function's.
pub fn roll_up_workloads(
    per_process_zone: &HashMap<ZoneName, Vec<ProcessShare>>,
    per_process_gpu_uj: &HashMap<ProcessIdentity, u64>,
    tracker_snapshot: &HashMap<ProcessIdentity, ProcessCounters>,
) -> (
    HashMap<String, WorkloadEnergy>,
    HashMap<String, WorkloadEnergy>,
    HashMap<String, WorkloadEnergy>,
) {
    let mut containers: HashMap<String, WorkloadEnergy> = HashMap::new();
    let mut pods: HashMap<String, WorkloadEnergy> = HashMap::new();
    let mut vms: HashMap<String, WorkloadEnergy> = HashMap::new();

    for (zone, shares) in per_process_zone {
        for share in shares {
            let zone_energy = ProcessZoneEnergy {
                idle_uj: share.idle_uj,
                dynamic_uj: share.dynamic_uj,
            };
            if let Some(cid) = &share.container_id {
                accumulate(&mut containers, cid, *zone, zone_energy, tracker_snapshot, &share.identity);
            }
            if let Some(pid) = &share.pod_id {
                accumulate(&mut pods, pid, *zone, zone_energy, tracker_snapshot, &share.identity);
            }
            if let Some(vid) = &share.vm_id {
                accumulate(&mut vms, vid, *zone, zone_energy, tracker_snapshot, &share.identity);
            }
        }
    }

    for (identity, gpu_uj) in per_process_gpu_uj {
        if let Some(counters) = tracker_snapshot.get(identity) {
            if let Some(cid) = &counters.container_id {
                containers.entry(cid.clone()).or_default().gpu_uj += gpu_uj;
            }
            if let Some(pid) = &counters.pod_id {
                pods.entry(pid.clone()).or_default().gpu_uj += gpu_uj;
            }
            if let Some(vid) = &counters.vm_id {
                vms.entry(vid.clone()).or_default().gpu_uj += gpu_uj;
            }
        }
    }

    (containers, pods, vms)
}

fn accumulate(
    map: &mut HashMap<String, WorkloadEnergy>,
    key: &str,
    zone: ZoneName,
    energy: ProcessZoneEnergy,
    tracker_snapshot: &HashMap<ProcessIdentity, ProcessCounters>,
    identity: &ProcessIdentity,
) {
    let entry = map.entry(key.to_string()).or_default();
    let zone_entry = entry.per_zone.entry(zone).or_default();
    zone_entry.idle_uj += energy.idle_uj;
    zone_entry.dynamic_uj += energy.dynamic_uj;

    if let Some(counters) = tracker_snapshot.get(identity) {
        if !counters.live {
            entry.terminated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::CounterSample;

    fn proc_with(identity: ProcessIdentity, cycles_delta: u64) -> ProcessCounters {
        let mut counters = HashMap::new();
        counters.insert(
            MetricKey::Cycles,
            CounterSample {
                cumulative: cycles_delta,
                delta: cycles_delta,
            },
        );
        ProcessCounters {
            identity,
            counters,
            live: true,
            ..Default::default()
        }
    }

    #[test]
    fn zero_live_processes_sends_everything_to_unattributed() {
        let attr = attribute_zone(
            ZoneName::Package,
            1_000,
            None,
            UsageMetricChoice::Metric(MetricKey::Cycles),
            &[],
        );
        assert!(attr.shares.is_empty());
        assert_eq!(attr.unattributed_dynamic_uj, 1_000);
    }

    #[test]
    fn splits_proportional_to_metric_usage() {
        let a = proc_with(ProcessIdentity::new(1, 1), 700);
        let b = proc_with(ProcessIdentity::new(2, 1), 300);
        let procs = vec![&a, &b];
        let attr = attribute_zone(
            ZoneName::Package,
            1_000,
            None,
            UsageMetricChoice::Metric(MetricKey::Cycles),
            &procs,
        );
        let share_a = attr.shares.iter().find(|s| s.identity.pid == 1).unwrap();
        let share_b = attr.shares.iter().find(|s| s.identity.pid == 2).unwrap();
        assert_eq!(share_a.dynamic_uj, 700);
        assert_eq!(share_b.dynamic_uj, 300);
    }

    #[test]
    fn zero_total_usage_splits_evenly() {
        let a = proc_with(ProcessIdentity::new(1, 1), 0);
        let b = proc_with(ProcessIdentity::new(2, 1), 0);
        let procs = vec![&a, &b];
        let attr = attribute_zone(
            ZoneName::Uncore,
            1_000,
            None,
            UsageMetricChoice::EvenSplit,
            &procs,
        );
        for share in &attr.shares {
            assert_eq!(share.dynamic_uj, 500);
        }
    }

    #[test]
    fn terminated_workload_still_receives_its_terminal_share() {
        let mut per_zone = HashMap::new();
        let identity = ProcessIdentity::new(9, 1);
        per_zone.insert(
            ZoneName::Package,
            vec![ProcessShare {
                identity,
                container_id: Some("c1".into()),
                pod_id: None,
                vm_id: None,
                idle_uj: 0,
                dynamic_uj: 700,
            }],
        );
        let mut tracker_snapshot = HashMap::new();
        let mut counters = proc_with(identity, 700);
        counters.container_id = Some("c1".into());
        counters.live = false; // terminated mid-tick
        tracker_snapshot.insert(identity, counters);

        let (containers, _, _) = roll_up_workloads(&per_zone, &HashMap::new(), &tracker_snapshot);
        let c1 = containers.get("c1").unwrap();
        assert!(c1.terminated);
        assert_eq!(c1.per_zone[&ZoneName::Package].dynamic_uj, 700);
    }
}
