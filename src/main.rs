use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use energy_attribution_core::backends::cpu::SysfsRaplBackend;
use energy_attribution_core::backends::gpu::NullGpuBackendFactory;
use energy_attribution_core::backends::BackendRegistry;
use energy_attribution_core::config::Config;
use energy_attribution_core::coordinator::Coordinator;
use energy_attribution_core::tracker::StaticResourceCollector;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "energy_attribution_core=info".into()),
        )
        .init();

    info!(
        "Starting energy attribution core v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env();
    info!(
        sample_period_sec = config.sample_period_sec,
        staleness_threshold_sec = config.staleness_threshold_sec,
        "configuration loaded"
    );

    let registry = BackendRegistry::assemble(
        vec![Box::new(SysfsRaplBackend::new())],
        vec![Box::new(NullGpuBackendFactory)],
    )
    .await?;

    // No process discovery strategy is wired in by default. The core
    // owns attribution, not enumeration (§1 non-goal). A real deployment
    // supplies its own `ResourceCollector` (procfs walk, cgroup walk,
    // orchestrator client) in place of this empty placeholder.
    let collector = Box::new(StaticResourceCollector::new(Vec::new()));

    let cancel = CancellationToken::new();
    let mut coordinator = Coordinator::new(config, registry, collector, cancel.clone());
    let mut reader = coordinator.subscribe();

    tokio::spawn(async move {
        loop {
            if reader.changed().await.is_err() {
                break;
            }
            let snapshot = reader.borrow().clone();
            log_snapshot(&snapshot);
        }
    });

    tokio::select! {
        _ = coordinator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("ctrl-c received, shutting down");
            cancel.cancel();
        }
    }

    Ok(())
}

fn log_snapshot(snapshot: &Arc<energy_attribution_core::Snapshot>) {
    info!(
        sequence = snapshot.sequence,
        zones = snapshot.zones.len(),
        gpus = snapshot.gpus.len(),
        processes = snapshot.processes.len(),
        degraded = snapshot.degradation.values().sum::<u32>(),
        "published snapshot"
    );
}
