//! Resource Tracker (§4.2): maintains the live set of processes with
//! their latest resource-usage counters, computing cumulative/delta pairs
//! and evicting terminated processes after the tombstone interval.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::identity::{MetricKey, ProcessIdentity};

/// A single counter's (cumulative, delta-since-previous-tick) pair.
/// Deltas are always clamped to >= 0 (§4.2): a counter that appears to
/// have gone backwards (process restart artifacts, counter reset) is
/// treated as "no progress this tick", not a negative delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSample {
    pub cumulative: u64,
    pub delta: u64,
}

/// Per-process, per-metric counter state carried between ticks.
#[derive(Debug, Clone, Default)]
pub struct ProcessCounters {
    pub identity: ProcessIdentity,
    pub container_id: Option<String>,
    pub pod_id: Option<String>,
    pub vm_id: Option<String>,
    pub command: String,
    pub counters: HashMap<MetricKey, CounterSample>,
    pub live: bool,
    /// Monotonic-nanosecond timestamp this identity was last observed.
    pub last_seen_ns: u64,
    /// Set once the process transitions to Terminated.
    pub terminated_at_ns: Option<u64>,
}

/// One tick's worth of raw collector input (§6 "Collector input"):
/// cumulative-only counters, keyed by stable identity. The tracker
/// computes deltas itself so collectors don't need to remember state.
#[derive(Debug, Clone, Default)]
pub struct ProcessObservation {
    pub identity: ProcessIdentity,
    pub container_id: Option<String>,
    pub pod_id: Option<String>,
    pub vm_id: Option<String>,
    pub command: String,
    pub counters: HashMap<MetricKey, u64>,
}

/// The external collaborator that supplies per-tick process observations
/// (§6). Discovery strategy (procfs walk, cgroup walk, orchestrator
/// client) is explicitly out of scope for the core (§1). This trait is
/// the seam. A collector that cannot obtain a real process start time
/// may report `start_time_ns = 0` as a documented degraded mode: pid
/// becomes the sole identity key for that process, so it is no longer
/// safe against pid reuse across a gap in observations.
#[async_trait]
pub trait ResourceCollector: Send + Sync {
    /// Collect the current set of observable processes. Implementations
    /// must not block longer than the tick budget; on partial failure,
    /// returning fewer processes than actually exist is preferable to
    /// erroring the whole tick (§4.2 "never blocks on I/O longer than
    /// the tick budget").
    async fn collect(&mut self) -> Vec<ProcessObservation>;
}

/// Maintains live process state across ticks, diffing cumulative
/// counters and evicting tombstoned entries.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    processes: HashMap<ProcessIdentity, ProcessCounters>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one tick's observations into tracked state, returning the
    /// identities seen this tick so callers can iterate without cloning
    /// the whole map.
    pub fn observe(&mut self, now_ns: u64, observations: Vec<ProcessObservation>) -> Vec<ProcessIdentity> {
        let mut seen = Vec::with_capacity(observations.len());

        for obs in observations {
            seen.push(obs.identity);
            let entry = self.processes.entry(obs.identity).or_insert_with(|| ProcessCounters {
                identity: obs.identity,
                ..Default::default()
            });

            entry.container_id = obs.container_id;
            entry.pod_id = obs.pod_id;
            entry.vm_id = obs.vm_id;
            entry.command = obs.command;
            entry.live = true;
            entry.last_seen_ns = now_ns;
            entry.terminated_at_ns = None;

            for key in [
                MetricKey::CpuTime,
                MetricKey::Cycles,
                MetricKey::Instructions,
                MetricKey::CacheMisses,
                MetricKey::PageCacheHits,
                MetricKey::IrqCounts,
            ] {
                let new_cumulative = obs.counters.get(&key).copied();
                let prior = entry.counters.get(&key).copied().unwrap_or_default();
                let sample = match new_cumulative {
                    Some(cumulative) => {
                        let delta = cumulative.saturating_sub(prior.cumulative);
                        CounterSample { cumulative, delta }
                    }
                    // Missing sample: hold the cumulative value, delta is 0 (§4.2).
                    None => CounterSample {
                        cumulative: prior.cumulative,
                        delta: 0,
                    },
                };
                entry.counters.insert(key, sample);
            }
        }

        // Anything tracked but not observed this tick transitions to
        // Terminated (its delta collapses to 0 from here on).
        for (identity, proc) in self.processes.iter_mut() {
            if proc.live && !seen.contains(identity) {
                proc.live = false;
                proc.terminated_at_ns = Some(now_ns);
                for sample in proc.counters.values_mut() {
                    sample.delta = 0;
                }
            }
        }

        seen
    }

    /// Evict processes terminated for longer than `tombstone_interval_ticks`
    /// worth of time, given the current tick's period. The eviction
    /// contract (§3) requires that a record's energy has already been
    /// included in at least one published snapshot before deletion; the
    /// Workload/Snapshot layer is responsible for calling this only
    /// *after* publishing, which this tracker enforces by taking
    /// `now_ns` from the caller rather than sampling its own clock.
    pub fn evict_tombstoned(&mut self, now_ns: u64, tombstone_window_ns: u64) {
        let before = self.processes.len();
        self.processes.retain(|_, proc| {
            match proc.terminated_at_ns {
                Some(terminated_at) => now_ns.saturating_sub(terminated_at) < tombstone_window_ns,
                None => true,
            }
        });
        let evicted = before - self.processes.len();
        if evicted > 0 {
            debug!(evicted, "evicted tombstoned process records");
        }
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&ProcessCounters> {
        self.processes.get(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessCounters> {
        self.processes.values()
    }

    pub fn live_iter(&self) -> impl Iterator<Item = &ProcessCounters> {
        self.processes.values().filter(|p| p.live)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// A fixed collector used in tests and scenario harnesses: returns the
/// same observations every tick until explicitly replaced.
#[derive(Debug, Default, Clone)]
pub struct StaticResourceCollector {
    pub observations: Vec<ProcessObservation>,
}

impl StaticResourceCollector {
    pub fn new(observations: Vec<ProcessObservation>) -> Self {
        Self { observations }
    }
}

#[async_trait]
impl ResourceCollector for StaticResourceCollector {
    async fn collect(&mut self) -> Vec<ProcessObservation> {
        self.observations.clone()
    }
}

/// Reads `/proc/<pid>/stat` for every numeric entry under `/proc`,
/// supplying cpu-time counters without any cgroup/container/pod/VM
/// awareness (§1 non-goal: discovery integrations are an external
/// collaborator's job; this collector leaves `container_id`/`pod_id`/
/// `vm_id` unset on every observation).
///
/// `start_time_ns` is derived from field 22 of `/proc/<pid>/stat`
/// (`starttime`, in clock ticks since boot) plus the host's boot time
/// from `/proc/stat`'s `btime` line, assuming the common `USER_HZ = 100`
/// clock tick rate. A host with a different configured tick rate would
/// need a collector that reads it from `sysconf`; this is the "collector
/// unable to obtain a real start time" degraded mode called out on
/// [`ResourceCollector`] when that assumption doesn't hold.
pub struct ProcfsResourceCollector {
    root: std::path::PathBuf,
    boot_time_secs: Option<u64>,
}

const ASSUMED_CLOCK_TICKS_PER_SEC: u64 = 100;

impl ProcfsResourceCollector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            boot_time_secs: None,
        }
    }

    fn boot_time_secs(&mut self) -> u64 {
        if let Some(cached) = self.boot_time_secs {
            return cached;
        }
        let btime = std::fs::read_to_string(self.root.join("stat"))
            .ok()
            .and_then(|contents| {
                contents.lines().find_map(|line| {
                    line.strip_prefix("btime ")
                        .and_then(|rest| rest.trim().parse::<u64>().ok())
                })
            })
            .unwrap_or(0);
        self.boot_time_secs = Some(btime);
        btime
    }

    fn read_one(&self, pid: u32, boot_time_secs: u64) -> Option<ProcessObservation> {
        let stat_path = self.root.join(pid.to_string()).join("stat");
        let contents = std::fs::read_to_string(&stat_path).ok()?;

        // comm is whatever sits between the first '(' and the last ')',
        // it may itself contain spaces or parens, so the remaining fields
        // are parsed from whatever follows the last ')'.
        let open = contents.find('(')?;
        let close = contents.rfind(')')?;
        let command = contents[open + 1..close].to_string();
        let rest: Vec<&str> = contents[close + 1..].split_whitespace().collect();
        // rest[0] is field 3 (state); utime/stime are fields 14/15, starttime is field 22.
        let utime: u64 = rest.get(11)?.parse().ok()?;
        let stime: u64 = rest.get(12)?.parse().ok()?;
        let starttime_ticks: u64 = rest.get(19)?.parse().ok()?;

        let start_time_ns = (boot_time_secs + starttime_ticks / ASSUMED_CLOCK_TICKS_PER_SEC)
            * 1_000_000_000;

        let mut counters = HashMap::new();
        counters.insert(MetricKey::CpuTime, utime + stime);

        Some(ProcessObservation {
            identity: ProcessIdentity::new(pid, start_time_ns),
            container_id: None,
            pod_id: None,
            vm_id: None,
            command,
            counters,
        })
    }
}

impl Default for ProcfsResourceCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceCollector for ProcfsResourceCollector {
    async fn collect(&mut self) -> Vec<ProcessObservation> {
        let boot_time_secs = self.boot_time_secs();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, root = %self.root.display(), "failed to read procfs root");
                return Vec::new();
            }
        };

        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse::<u32>().ok())
            .filter_map(|pid| self.read_one(pid, boot_time_secs))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(pid: u32, start: u64, cycles: u64) -> ProcessObservation {
        let mut counters = HashMap::new();
        counters.insert(MetricKey::Cycles, cycles);
        ProcessObservation {
            identity: ProcessIdentity::new(pid, start),
            command: "test".into(),
            counters,
            ..Default::default()
        }
    }

    #[test]
    fn first_sighting_has_zero_delta() {
        let mut tracker = ResourceTracker::new();
        tracker.observe(1_000, vec![obs(1, 1, 500)]);
        let p = tracker.get(&ProcessIdentity::new(1, 1)).unwrap();
        assert_eq!(p.counters[&MetricKey::Cycles].cumulative, 500);
        assert_eq!(p.counters[&MetricKey::Cycles].delta, 0);
    }

    #[test]
    fn second_sighting_computes_delta() {
        let mut tracker = ResourceTracker::new();
        tracker.observe(1_000, vec![obs(1, 1, 500)]);
        tracker.observe(2_000, vec![obs(1, 1, 800)]);
        let p = tracker.get(&ProcessIdentity::new(1, 1)).unwrap();
        assert_eq!(p.counters[&MetricKey::Cycles].delta, 300);
    }

    #[test]
    fn delta_never_goes_negative_on_counter_regression() {
        let mut tracker = ResourceTracker::new();
        tracker.observe(1_000, vec![obs(1, 1, 800)]);
        tracker.observe(2_000, vec![obs(1, 1, 100)]);
        let p = tracker.get(&ProcessIdentity::new(1, 1)).unwrap();
        assert_eq!(p.counters[&MetricKey::Cycles].delta, 0);
    }

    #[test]
    fn missing_process_transitions_to_terminated_with_zero_delta() {
        let mut tracker = ResourceTracker::new();
        tracker.observe(1_000, vec![obs(1, 1, 500)]);
        tracker.observe(2_000, vec![obs(1, 1, 800)]);
        tracker.observe(3_000, vec![]);
        let p = tracker.get(&ProcessIdentity::new(1, 1)).unwrap();
        assert!(!p.live);
        assert_eq!(p.terminated_at_ns, Some(3_000));
        assert_eq!(p.counters[&MetricKey::Cycles].delta, 0);
    }

    #[test]
    fn tombstoned_process_is_evicted_after_window() {
        let mut tracker = ResourceTracker::new();
        tracker.observe(1_000, vec![obs(1, 1, 500)]);
        tracker.observe(2_000, vec![]);
        assert_eq!(tracker.len(), 1);
        tracker.evict_tombstoned(2_500, 1_000);
        assert_eq!(tracker.len(), 1, "not yet past the window");
        tracker.evict_tombstoned(3_500, 1_000);
        assert_eq!(tracker.len(), 0, "past the window");
    }

    #[test]
    fn reused_pid_with_different_start_time_is_a_distinct_record() {
        let mut tracker = ResourceTracker::new();
        tracker.observe(1_000, vec![obs(1, 1, 500)]);
        tracker.observe(2_000, vec![]);
        tracker.observe(3_000, vec![obs(1, 2, 10)]);
        assert_eq!(tracker.len(), 2);
        let reused = tracker.get(&ProcessIdentity::new(1, 2)).unwrap();
        assert_eq!(reused.counters[&MetricKey::Cycles].cumulative, 10);
    }

    struct FakeProcDir {
        path: std::path::PathBuf,
    }

    impl FakeProcDir {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("energy-attribution-core-test-{name}"));
            std::fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        fn write_stat(&self, pid: u32, comm: &str, utime: u64, stime: u64, starttime: u64) {
            let pid_dir = self.path.join(pid.to_string());
            std::fs::create_dir_all(&pid_dir).unwrap();
            // Minimal but positionally faithful /proc/<pid>/stat line.
            let line = format!(
                "{pid} ({comm}) S 1 1 1 0 -1 0 0 0 0 0 {utime} {stime} 0 0 20 0 1 0 {starttime} 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0"
            );
            std::fs::write(pid_dir.join("stat"), line).unwrap();
        }

        fn write_boot_time(&self, btime_secs: u64) {
            std::fs::write(self.path.join("stat"), format!("btime {btime_secs}\n")).unwrap();
        }
    }

    impl Drop for FakeProcDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[tokio::test]
    async fn procfs_collector_parses_cpu_time_and_start_time() {
        let fake = FakeProcDir::new("parses-cpu-time");
        fake.write_boot_time(1_000);
        fake.write_stat(42, "worker", 300, 200, 500);

        let mut collector = ProcfsResourceCollector::with_root(&fake.path);
        let observations = collector.collect().await;
        assert_eq!(observations.len(), 1);
        let obs = &observations[0];
        assert_eq!(obs.identity.pid, 42);
        assert_eq!(obs.command, "worker");
        assert_eq!(obs.counters[&MetricKey::CpuTime], 500);
        // boot_time_secs(1000) + starttime_ticks(500)/100 = 1005s -> ns
        assert_eq!(obs.identity.start_time_ns, 1_005_000_000_000);
    }

    #[tokio::test]
    async fn procfs_collector_ignores_non_numeric_entries() {
        let fake = FakeProcDir::new("ignores-non-numeric");
        fake.write_boot_time(0);
        std::fs::create_dir_all(fake.path.join("self")).unwrap();

        let mut collector = ProcfsResourceCollector::with_root(&fake.path);
        let observations = collector.collect().await;
        assert!(observations.is_empty());
    }
}
