//! The CPU power backend (§4.1): a collection of Energy Zones, each
//! reporting a raw accumulated energy counter and the max raw value past
//! which it wraps. Wrap *detection* is the Node Energy Aggregator's job
//! (§4.5). This layer only reports raw readings faithfully.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use super::CpuBackendFactory;
use crate::error::EngineError;
use crate::identity::ZoneName;

/// One raw reading from one energy zone, taken atomically with respect to
/// the other zones read in the same backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyZoneReading {
    pub zone: ZoneName,
    /// Socket/package index this zone instance belongs to.
    pub socket_index: u32,
    pub raw_energy_uj: u64,
    pub max_raw_uj: u64,
}

/// Capability set {initialize, enumerate zones, sample, shutdown} for a
/// CPU power backend (§4.1). Implementations must be thread-safe for
/// concurrent reads. The coordinator is the only writer but any number
/// of diagnostic callers may read concurrently with it.
#[async_trait]
pub trait CpuBackend: Send + Sync {
    /// Stable backend name used in logs and degradation summaries.
    fn name(&self) -> &str;

    /// The zones this backend currently knows about. Fixed after
    /// `initialize` for the life of the backend.
    fn zones(&self) -> &[EnergyZoneReading];

    /// Read a fresh value for every zone. Implementations should return
    /// one reading per known zone, in any order; a missing zone on a
    /// given call is reported via `Err` for that specific read, not by
    /// omitting it from the returned vector.
    async fn sample(&mut self) -> Result<Vec<EnergyZoneReading>, EngineError>;

    async fn shutdown(&mut self) {}
}

/// Pick the canonical energy source when composing totals: widest
/// coverage, preferring "package" (§4.1 "primary zone selector").
pub fn primary_zone(zones: &[EnergyZoneReading]) -> Option<ZoneName> {
    if zones.iter().any(|z| z.zone == ZoneName::Package) {
        return Some(ZoneName::Package);
    }
    // Fall back to whichever zone covers the most sockets.
    let mut best: Option<(ZoneName, usize)> = None;
    for z in zones {
        let count = zones.iter().filter(|o| o.zone == z.zone).count();
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((z.zone, count));
        }
    }
    best.map(|(z, _)| z)
}

/// Reads the Linux `powercap` sysfs tree
/// (`/sys/class/powercap/intel-rapl:*`). Absence of the tree (non-Linux,
/// sandboxed container, VM without RAPL passthrough) is a normal,
/// non-fatal condition for this backend specifically; the registry
/// simply drops it during assembly (§4.1).
pub struct SysfsRaplBackend {
    root: PathBuf,
    zones: Vec<RaplZone>,
}

struct RaplZone {
    reading_zone: ZoneName,
    socket_index: u32,
    path: PathBuf,
    max_raw_uj: u64,
}

impl SysfsRaplBackend {
    const DEFAULT_ROOT: &'static str = "/sys/class/powercap";

    pub fn new() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            zones: Vec::new(),
        }
    }

    fn discover(&mut self) -> Result<(), EngineError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| EngineError::SensorUnavailable {
            backend: "cpu-rapl".into(),
            reason: format!("cannot read {}: {e}", self.root.display()),
        })?;

        let mut zones = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.starts_with("intel-rapl:") {
                continue;
            }
            // Top-level RAPL zones (e.g. intel-rapl:0) are package domains;
            // nested subzones (intel-rapl:0:0) are cores/dram/uncore.
            let socket_index: u32 = name
                .trim_start_matches("intel-rapl:")
                .split(':')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let zone_label = std::fs::read_to_string(path.join("name"))
                .unwrap_or_default()
                .trim()
                .to_string();
            let reading_zone = match classify_zone_label(&zone_label, name.contains(':') && name.matches(':').count() == 1) {
                Some(z) => z,
                None => continue,
            };

            let max_raw_uj = std::fs::read_to_string(path.join("max_energy_range_uj"))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(u64::MAX);

            zones.push(RaplZone {
                reading_zone,
                socket_index,
                path,
                max_raw_uj,
            });
        }
        self.zones = zones;
        Ok(())
    }
}

impl Default for SysfsRaplBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a RAPL `name` file's content to our closed zone-name set.
/// RAPL's own "package"/"core"/"dram"/"uncore" labels line up directly;
/// anything unrecognized is skipped rather than guessed at.
fn classify_zone_label(label: &str, is_top_level: bool) -> Option<ZoneName> {
    match label {
        "package" | "psys" if is_top_level => Some(ZoneName::Package),
        "package" => Some(ZoneName::Package),
        "core" => Some(ZoneName::Core),
        "dram" => Some(ZoneName::Dram),
        "uncore" => Some(ZoneName::Uncore),
        "platform" | "psys" => Some(ZoneName::Platform),
        _ => None,
    }
}

#[async_trait]
impl CpuBackend for SysfsRaplBackend {
    fn name(&self) -> &str {
        "cpu-rapl-sysfs"
    }

    fn zones(&self) -> &[EnergyZoneReading] {
        // Populated lazily; callers needing a static view should call
        // `sample()` at least once. Returning an empty slice here when
        // `discover` hasn't run yet is intentional, it mirrors "no zones
        // known until sampled".
        &[]
    }

    async fn sample(&mut self) -> Result<Vec<EnergyZoneReading>, EngineError> {
        if self.zones.is_empty() {
            self.discover()?;
        }
        if self.zones.is_empty() {
            return Err(EngineError::SensorUnavailable {
                backend: self.name().to_string(),
                reason: "no RAPL zones discovered".into(),
            });
        }

        let mut out = Vec::with_capacity(self.zones.len());
        for zone in &self.zones {
            let raw = std::fs::read_to_string(zone.path.join("energy_uj"))
                .ok()
                .and_then(|s| s.trim().parse().ok());
            match raw {
                Some(raw_energy_uj) => out.push(EnergyZoneReading {
                    zone: zone.reading_zone,
                    socket_index: zone.socket_index,
                    raw_energy_uj,
                    max_raw_uj: zone.max_raw_uj,
                }),
                None => {
                    warn!(zone = %zone.reading_zone, path = %zone.path.display(), "failed to read energy_uj");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl CpuBackendFactory for SysfsRaplBackend {
    async fn probe(&self) -> Result<Option<Box<dyn CpuBackend>>, EngineError> {
        let mut candidate = SysfsRaplBackend::with_root(&self.root);
        match candidate.discover() {
            Ok(()) if !candidate.zones.is_empty() => Ok(Some(Box::new(candidate))),
            Ok(()) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(zone: ZoneName, socket: u32, raw: u64, max: u64) -> EnergyZoneReading {
        EnergyZoneReading {
            zone,
            socket_index: socket,
            raw_energy_uj: raw,
            max_raw_uj: max,
        }
    }

    #[test]
    fn primary_zone_prefers_package() {
        let zones = vec![
            reading(ZoneName::Core, 0, 0, 1),
            reading(ZoneName::Package, 0, 0, 1),
        ];
        assert_eq!(primary_zone(&zones), Some(ZoneName::Package));
    }

    #[test]
    fn primary_zone_falls_back_to_widest_coverage() {
        let zones = vec![
            reading(ZoneName::Core, 0, 0, 1),
            reading(ZoneName::Core, 1, 0, 1),
            reading(ZoneName::Dram, 0, 0, 1),
        ];
        assert_eq!(primary_zone(&zones), Some(ZoneName::Core));
    }

    #[test]
    fn primary_zone_empty_input_returns_none() {
        assert_eq!(primary_zone(&[]), None);
    }

    #[tokio::test]
    async fn missing_powercap_root_is_unavailable_not_panic() {
        let mut backend = SysfsRaplBackend::with_root("/nonexistent/powercap/root/for/tests");
        let result = backend.sample().await;
        assert!(matches!(result, Err(EngineError::SensorUnavailable { .. })));
    }
}
