//! Snapshot Coordinator (§4.7, §5): the single writer that drives one
//! tick through sensor reads, aggregation, attribution, and workload
//! roll-up, then publishes an immutable [`Snapshot`] for any number of
//! concurrent readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{BackendRegistry, EnergyZoneReading, GpuDeviceReading};
use crate::config::Config;
use crate::error::{DegradationKind, EngineError};
use crate::gpu_attribution::{attribute_device, IdleBaselineTracker};
use crate::identity::{ProcessIdentity, ZoneName};
use crate::node_aggregator::NodeEnergyAggregator;
use crate::sharing_mode::SharingModeDetector;
use crate::snapshot::{DegradationSummary, GpuEnergy, ProcessEnergy, ProcessZoneEnergy, Snapshot};
use crate::tracker::{ResourceCollector, ResourceTracker};
use crate::workload_attribution::{attribute_zone, roll_up_workloads, ProcessShare};

/// The single-writer tick engine. Cloning a [`Coordinator`] is not
/// supported; `subscribe()` hands out cheap reader handles instead, the
/// same separation of "one writer, many readers" the node-level `watch`
/// channel is built for (§4.7, §9 "single-writer/multi-reader model").
pub struct Coordinator {
    config: Config,
    registry: BackendRegistry,
    tracker: ResourceTracker,
    collector: Box<dyn ResourceCollector>,
    aggregator: NodeEnergyAggregator,
    idle_baselines: IdleBaselineTracker,
    sharing_modes: SharingModeDetector,
    /// Per-device running total of cumulative GPU energy (§3 "GPU Device",
    /// §6 `gpus[].absolute_energy_uj`), keyed by device UUID. Used only as
    /// a fallback when a backend reading doesn't carry its own hardware
    /// cumulative-energy counter (`GpuDeviceReading.total_energy_uj`).
    gpu_energy_totals: HashMap<String, u64>,
    sequence: u64,
    publisher: watch::Sender<Arc<Snapshot>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Build a coordinator and its first (default) published snapshot.
    /// Callers obtain readers via `subscribe()` before calling `run()`.
    pub fn new(
        config: Config,
        registry: BackendRegistry,
        collector: Box<dyn ResourceCollector>,
        cancel: CancellationToken,
    ) -> Self {
        let (publisher, _receiver) = watch::channel(Arc::new(Snapshot::default()));
        let idle_window_ticks = config.idle_window_ticks;
        Self {
            config,
            registry,
            tracker: ResourceTracker::new(),
            collector,
            aggregator: NodeEnergyAggregator::new(idle_window_ticks),
            idle_baselines: IdleBaselineTracker::new(),
            sharing_modes: SharingModeDetector::new(),
            gpu_energy_totals: HashMap::new(),
            sequence: 0,
            publisher,
            cancel,
        }
    }

    /// A new reader handle. Readers never block the writer and are never
    /// blocked by it. Each holds its own `Arc<Snapshot>` until the next
    /// tick replaces it (§4.7).
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    /// The most recently published snapshot, with no subscription required.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.publisher.borrow().clone()
    }

    /// Run the tick loop until the cancellation token fires. Each tick
    /// sleeps for `config.sample_period_sec`, then runs one full
    /// collect-aggregate-attribute-publish cycle (§4.7 steps 1–7).
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.sample_period_sec));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested, stopping tick loop");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Run exactly one tick, publishing the resulting snapshot. Exposed
    /// directly so tests (and the smoke-test binary) can drive individual
    /// ticks without sleeping through `sample_period_sec`.
    pub async fn tick(&mut self) {
        let now_ns = monotonic_now_ns();
        let mut degradation: DegradationSummary = HashMap::new();
        let timeout_dur = Duration::from_millis(self.config.backend_timeout_ms);

        // §2 data flow: "G triggers A+B concurrently" — sensor backends
        // (cpu, gpu) and the resource tracker's collector are independent
        // suspension points (§5) and run as a single joined future rather
        // than three sequential awaits. Borrowing the registry's two
        // backend vectors and the collector as disjoint fields (instead
        // of through `&mut self` methods) is what lets the borrow checker
        // see they don't alias.
        let cpu_backends = &mut self.registry.cpu_backends;
        let gpu_backends = &mut self.registry.gpu_backends;
        let collector = &mut self.collector;
        let ((cpu_readings, cpu_errors), (gpu_readings, gpu_errors), observations) = tokio::join!(
            sample_cpu_backends(cpu_backends, timeout_dur),
            sample_gpu_backends(gpu_backends, timeout_dur),
            collector.collect(),
        );

        for err in cpu_errors.iter().chain(gpu_errors.iter()) {
            record_degradation(&mut degradation, err);
        }

        self.tracker.observe(now_ns, observations);
        self.sharing_modes.refresh(&gpu_readings);

        let (zone_energies, wrap_errors) = self.aggregator.tick(&cpu_readings);
        for err in &wrap_errors {
            record_degradation(&mut degradation, err);
        }

        let live: Vec<_> = self.tracker.live_iter().collect();

        let mut zones_out = HashMap::new();
        let mut per_process_zone: HashMap<ZoneName, Vec<ProcessShare>> = HashMap::new();
        let mut unattributed_dynamic_uj = HashMap::new();

        for (zone, tick_energy) in &zone_energies {
            zones_out.insert(*zone, tick_energy.energy);

            let metric_choice = self.metric_for_zone(*zone);
            let idle_exposed = self.config.expose_idle && !self.config.multi_tenant_opaque;
            // §4.6 splits node dynamic energy *at tick t*, not the
            // cumulative `energy.dynamic_uj`/`energy.idle_uj` accumulators
            // (those are monotonic totals published in `zones_out` above).
            let idle_for_split = if idle_exposed {
                Some(tick_energy.idle_this_tick_uj)
            } else {
                None
            };

            let attribution = attribute_zone(
                *zone,
                tick_energy.dynamic_this_tick_uj,
                idle_for_split,
                metric_choice,
                &live,
            );
            unattributed_dynamic_uj.insert(*zone, attribution.unattributed_dynamic_uj);
            per_process_zone.entry(*zone).or_default().extend(attribution.shares);
        }

        let mut gpus_out = HashMap::new();
        let mut per_process_gpu_uj: HashMap<ProcessIdentity, u64> = HashMap::new();

        for reading in &gpu_readings {
            let mode = self.sharing_modes.mode(&reading.device_uuid);
            self.idle_baselines.observe(
                &reading.device_uuid,
                reading.total_power_uw,
                reading.running_processes.len(),
            );
            let baseline = self.idle_baselines.baseline(&reading.device_uuid);

            let utilization = self
                .utilization_for(&reading.device_uuid)
                .await
                .unwrap_or_default();

            let attr = attribute_device(
                reading,
                mode,
                &baseline,
                self.config.gpu_idle_power_uw,
                &utilization,
            );

            // µJ = µW × s: both power and energy are already carried in
            // micro-units, so multiplying by a plain seconds count needs
            // no further scaling (§8 scenario 1: 150,000,000 µW over a
            // 3 s tick -> 450,000,000 µJ).
            let tick_energy_uj =
                attr.total_power_uw.saturating_mul(self.config.sample_period_sec);

            // `absolute_energy_uj` is the device's cumulative energy
            // counter (§3 GPU Device, §6), not this tick's contribution.
            // Prefer the backend's own hardware counter when it reports
            // one; otherwise accumulate the tick-derived energy ourselves
            // so the published figure still only grows.
            let absolute_energy_uj = match reading.total_energy_uj {
                Some(hardware_total) => {
                    self.gpu_energy_totals
                        .insert(reading.device_uuid.clone(), hardware_total);
                    hardware_total
                }
                None => {
                    let total = self
                        .gpu_energy_totals
                        .entry(reading.device_uuid.clone())
                        .or_insert(0);
                    *total = total.saturating_add(tick_energy_uj);
                    *total
                }
            };

            gpus_out.insert(
                reading.device_uuid.clone(),
                GpuEnergy {
                    total_power_uw: attr.total_power_uw,
                    idle_power_uw: attr.idle_power_uw,
                    active_power_uw: attr.active_power_uw,
                    absolute_energy_uj,
                },
            );

            for share in &attr.shares {
                if let Some(identity) = self.resolve_identity(share.pid) {
                    let share_uj = share.power_uw.saturating_mul(self.config.sample_period_sec);
                    *per_process_gpu_uj.entry(identity).or_insert(0) += share_uj;
                }
            }
        }

        let tracker_snapshot: HashMap<ProcessIdentity, crate::tracker::ProcessCounters> = self
            .tracker
            .iter()
            .map(|p| (p.identity, p.clone()))
            .collect();

        let processes_out = build_process_energy(&per_process_zone, &per_process_gpu_uj, &tracker_snapshot);
        let (containers, pods, vms) =
            roll_up_workloads(&per_process_zone, &per_process_gpu_uj, &tracker_snapshot);

        self.sequence += 1;
        let snapshot = Snapshot {
            sequence: self.sequence,
            wall_time: chrono::Utc::now(),
            monotonic_time_ns: now_ns,
            published_at_ns: now_ns,
            zones: zones_out,
            gpus: gpus_out,
            processes: processes_out,
            containers,
            pods,
            vms,
            unattributed_dynamic_uj,
            degradation,
        };

        debug!(sequence = snapshot.sequence, "publishing snapshot");
        // `send` only errors when every receiver has been dropped, which
        // is not a tick failure, there is simply no one listening yet.
        let _ = self.publisher.send(Arc::new(snapshot));

        self.tracker
            .evict_tombstoned(now_ns, self.tombstone_window_ns());
    }

    fn tombstone_window_ns(&self) -> u64 {
        self.config.tombstone_interval_ticks as u64 * self.config.sample_period_sec * 1_000_000_000
    }

    fn metric_for_zone(&self, zone: ZoneName) -> crate::config::UsageMetricChoice {
        match zone {
            ZoneName::Package | ZoneName::Core => self.config.core_usage_metric,
            ZoneName::Dram => self.config.dram_usage_metric,
            ZoneName::Uncore => self.config.uncore_usage_metric,
            ZoneName::Platform => self.config.platform_usage_metric,
        }
    }

    fn resolve_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        self.tracker
            .iter()
            .find(|p| p.identity.pid == pid && p.live)
            .map(|p| p.identity)
    }

    async fn utilization_for(&mut self, device_uuid: &str) -> Option<Vec<crate::backends::GpuProcessUtilization>> {
        for backend in &mut self.registry.gpu_backends {
            match backend.process_utilization(device_uuid).await {
                Ok(u) => return Some(u),
                Err(_) => continue,
            }
        }
        None
    }
}

/// Sample every CPU backend concurrently (§5: "they run concurrently
/// across backends within one tick"), each bounded by `timeout_dur`. A
/// per-backend timeout degrades that one backend, it never aborts the
/// others in flight.
async fn sample_cpu_backends(
    backends: &mut [Box<dyn crate::backends::cpu::CpuBackend>],
    timeout_dur: Duration,
) -> (Vec<EnergyZoneReading>, Vec<EngineError>) {
    let reads = backends.iter_mut().map(|backend| async move {
        let name = backend.name().to_string();
        match timeout(timeout_dur, backend.sample()).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(backend = %name, "cpu backend read timed out");
                Err(EngineError::SensorTransient {
                    backend: name,
                    target: "*".into(),
                    reason: "read timed out".into(),
                })
            }
        }
    });

    let mut readings = Vec::new();
    let mut errors = Vec::new();
    for result in futures::future::join_all(reads).await {
        match result {
            Ok(r) => readings.extend(r),
            Err(e) => errors.push(e),
        }
    }
    (readings, errors)
}

/// Symmetric to [`sample_cpu_backends`] for the GPU side.
async fn sample_gpu_backends(
    backends: &mut [Box<dyn crate::backends::gpu::GpuBackend>],
    timeout_dur: Duration,
) -> (Vec<GpuDeviceReading>, Vec<EngineError>) {
    let reads = backends.iter_mut().map(|backend| async move {
        let name = backend.name().to_string();
        match timeout(timeout_dur, backend.sample()).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(backend = %name, "gpu backend read timed out");
                Err(EngineError::SensorTransient {
                    backend: name,
                    target: "*".into(),
                    reason: "read timed out".into(),
                })
            }
        }
    });

    let mut readings = Vec::new();
    let mut errors = Vec::new();
    for result in futures::future::join_all(reads).await {
        match result {
            Ok(r) => readings.extend(r),
            Err(e) => errors.push(e),
        }
    }
    (readings, errors)
}

/// Assert a reader's snapshot is fresh enough per §7's freshness-guard
/// contract; callers that never check this still get a snapshot, just
/// without the staleness guarantee.
pub fn check_freshness(snapshot: &Snapshot, now_ns: u64, threshold_sec: u64) -> Result<(), EngineError> {
    let age_secs = snapshot.age_ns(now_ns) / 1_000_000_000;
    if age_secs > threshold_sec {
        return Err(EngineError::StaleSnapshot {
            age_secs,
            threshold_secs: threshold_sec,
        });
    }
    Ok(())
}

fn record_degradation(summary: &mut DegradationSummary, err: &EngineError) {
    if let Some(kind) = Option::<DegradationKind>::from(err) {
        *summary.entry(kind).or_insert(0) += 1;
    }
}

fn build_process_energy(
    per_process_zone: &HashMap<ZoneName, Vec<ProcessShare>>,
    per_process_gpu_uj: &HashMap<ProcessIdentity, u64>,
    tracker_snapshot: &HashMap<ProcessIdentity, crate::tracker::ProcessCounters>,
) -> HashMap<ProcessIdentity, ProcessEnergy> {
    let mut out: HashMap<ProcessIdentity, ProcessEnergy> = HashMap::new();

    for (zone, shares) in per_process_zone {
        for share in shares {
            let entry = out.entry(share.identity).or_insert_with(|| ProcessEnergy {
                container_id: share.container_id.clone(),
                pod_id: share.pod_id.clone(),
                vm_id: share.vm_id.clone(),
                ..Default::default()
            });
            entry.per_zone.insert(
                *zone,
                ProcessZoneEnergy {
                    idle_uj: share.idle_uj,
                    dynamic_uj: share.dynamic_uj,
                },
            );
        }
    }

    for (identity, gpu_uj) in per_process_gpu_uj {
        let entry = out.entry(*identity).or_insert_with(|| {
            let counters = tracker_snapshot.get(identity);
            ProcessEnergy {
                container_id: counters.and_then(|c| c.container_id.clone()),
                pod_id: counters.and_then(|c| c.pod_id.clone()),
                vm_id: counters.and_then(|c| c.vm_id.clone()),
                ..Default::default()
            }
        });
        entry.gpu_uj += gpu_uj;
    }

    out
}

fn monotonic_now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
