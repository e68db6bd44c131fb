//! Stable identity types for processes, workloads, energy zones, and metrics.
//!
//! A pid alone is not a safe identity key across the lifetime of a node,
//! pids are reused. Every process-shaped record in this crate is keyed by
//! `(pid, start_time_ns)` instead, per spec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identity of a single process: pid plus the monotonic-nanosecond
/// timestamp at which it started. Guards against pid reuse between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time_ns: u64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, start_time_ns: u64) -> Self {
        Self {
            pid,
            start_time_ns,
        }
    }
}

impl Default for ProcessIdentity {
    fn default() -> Self {
        Self {
            pid: 0,
            start_time_ns: 0,
        }
    }
}

impl fmt::Display for ProcessIdentity {
    /// Serializes as `pid@start_time_ns`, the wire form mandated by §6.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time_ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseProcessIdentityError(String);

impl fmt::Display for ParseProcessIdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid process identity: {}", self.0)
    }
}

impl std::error::Error for ParseProcessIdentityError {}

impl FromStr for ProcessIdentity {
    type Err = ParseProcessIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pid_part, start_part) = s
            .split_once('@')
            .ok_or_else(|| ParseProcessIdentityError(s.to_string()))?;
        let pid = pid_part
            .parse()
            .map_err(|_| ParseProcessIdentityError(s.to_string()))?;
        let start_time_ns = start_part
            .parse()
            .map_err(|_| ParseProcessIdentityError(s.to_string()))?;
        Ok(Self {
            pid,
            start_time_ns,
        })
    }
}

impl Serialize for ProcessIdentity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProcessIdentity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed set of energy zone names, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneName {
    Package,
    Core,
    Dram,
    Uncore,
    Platform,
}

impl ZoneName {
    pub const ALL: [ZoneName; 5] = [
        ZoneName::Package,
        ZoneName::Core,
        ZoneName::Dram,
        ZoneName::Uncore,
        ZoneName::Platform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneName::Package => "package",
            ZoneName::Core => "core",
            ZoneName::Dram => "dram",
            ZoneName::Uncore => "uncore",
            ZoneName::Platform => "platform",
        }
    }
}

impl fmt::Display for ZoneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZoneName {
    type Err = ParseProcessIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "package" => Ok(ZoneName::Package),
            "core" => Ok(ZoneName::Core),
            "dram" => Ok(ZoneName::Dram),
            "uncore" => Ok(ZoneName::Uncore),
            "platform" => Ok(ZoneName::Platform),
            other => Err(ParseProcessIdentityError(other.to_string())),
        }
    }
}

/// Closed set of resource-usage metric keys a workload can be billed by, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    CpuTime,
    Cycles,
    Instructions,
    CacheMisses,
    PageCacheHits,
    IrqCounts,
}

impl MetricKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::CpuTime => "cpu_time",
            MetricKey::Cycles => "cycles",
            MetricKey::Instructions => "instructions",
            MetricKey::CacheMisses => "cache_misses",
            MetricKey::PageCacheHits => "page_cache_hits",
            MetricKey::IrqCounts => "irq_counts",
        }
    }
}

impl FromStr for MetricKey {
    type Err = ParseProcessIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu_time" => Ok(MetricKey::CpuTime),
            "cycles" => Ok(MetricKey::Cycles),
            "instructions" => Ok(MetricKey::Instructions),
            "cache_misses" => Ok(MetricKey::CacheMisses),
            "page_cache_hits" => Ok(MetricKey::PageCacheHits),
            "irq_counts" => Ok(MetricKey::IrqCounts),
            other => Err(ParseProcessIdentityError(other.to_string())),
        }
    }
}

/// GPU vendor tag, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Unknown,
}
