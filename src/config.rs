//! Configuration surface (§6). Every option here is read from the
//! environment with a typed default, following this repository's
//! `AppConfig::from_env()` convention: no config file format is
//! prescribed, only names and effects.

use crate::identity::MetricKey;

/// How a zone's resource-usage metric should be chosen, including the
/// zone-specific "no metric, split evenly" option (§4.6, uncore default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMetricChoice {
    Metric(MetricKey),
    EvenSplit,
}

impl UsageMetricChoice {
    fn from_env(var: &str, default: UsageMetricChoice) -> Self {
        match std::env::var(var) {
            Ok(v) if v.eq_ignore_ascii_case("empty") => UsageMetricChoice::EvenSplit,
            Ok(v) => v
                .parse::<MetricKey>()
                .map(UsageMetricChoice::Metric)
                .unwrap_or(default),
            Err(_) => default,
        }
    }
}

/// Recognized configuration surface of the core (§6 table).
#[derive(Debug, Clone)]
pub struct Config {
    /// Tick period; integer seconds >= 1 (env: `ENERGY_SAMPLE_PERIOD_SEC`, default 3).
    pub sample_period_sec: u64,

    /// Max allowed snapshot age before readers see a freshness error
    /// (env: `ENERGY_STALENESS_THRESHOLD_SEC`, default 10).
    pub staleness_threshold_sec: u64,

    /// Ticks a terminated workload is retained
    /// (env: `ENERGY_TOMBSTONE_INTERVAL_TICKS`, default 1).
    pub tombstone_interval_ticks: u32,

    /// Size of the sliding window for zone idle-baseline learning
    /// (env: `ENERGY_IDLE_WINDOW_TICKS`, default 60).
    pub idle_window_ticks: usize,

    /// Whether per-workload idle energy is exposed
    /// (env: `ENERGY_EXPOSE_IDLE`, default false).
    pub expose_idle: bool,

    /// Per-device override of the GPU idle-power baseline, in microwatts.
    /// When set, idle-power learning is suppressed for every device
    /// (env: `ENERGY_GPU_IDLE_POWER_UW`, default unset).
    pub gpu_idle_power_uw: Option<u64>,

    /// Resource-usage metric used to split package-domain dynamic energy
    /// (env: `ENERGY_CORE_USAGE_METRIC`, default `cycles`).
    pub core_usage_metric: UsageMetricChoice,

    /// Resource-usage metric used to split dram-domain dynamic energy
    /// (env: `ENERGY_DRAM_USAGE_METRIC`, default `cache_misses`).
    pub dram_usage_metric: UsageMetricChoice,

    /// Resource-usage metric used to split uncore-domain dynamic energy
    /// (env: `ENERGY_UNCORE_USAGE_METRIC`, default even split / no metric).
    pub uncore_usage_metric: UsageMetricChoice,

    /// Resource-usage metric used to split platform-domain dynamic energy
    /// (env: `ENERGY_PLATFORM_USAGE_METRIC`, default `cpu_time`).
    pub platform_usage_metric: UsageMetricChoice,

    /// Whether the deployment is a multi-tenant virtualized host where
    /// co-tenants are invisible; suppresses per-workload idle exposure
    /// regardless of `expose_idle` (env: `ENERGY_MULTI_TENANT_OPAQUE`, default false).
    pub multi_tenant_opaque: bool,

    /// Bounded per-backend per-tick read timeout, in milliseconds
    /// (env: `ENERGY_BACKEND_TIMEOUT_MS`, default 2000).
    pub backend_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_period_sec: 3,
            staleness_threshold_sec: 10,
            tombstone_interval_ticks: 1,
            idle_window_ticks: 60,
            expose_idle: false,
            gpu_idle_power_uw: None,
            core_usage_metric: UsageMetricChoice::Metric(MetricKey::Cycles),
            dram_usage_metric: UsageMetricChoice::Metric(MetricKey::CacheMisses),
            uncore_usage_metric: UsageMetricChoice::EvenSplit,
            platform_usage_metric: UsageMetricChoice::Metric(MetricKey::CpuTime),
            multi_tenant_opaque: false,
            backend_timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to spec
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sample_period_sec: env_u64("ENERGY_SAMPLE_PERIOD_SEC", defaults.sample_period_sec)
                .max(1),
            staleness_threshold_sec: env_u64(
                "ENERGY_STALENESS_THRESHOLD_SEC",
                defaults.staleness_threshold_sec,
            ),
            tombstone_interval_ticks: env_u64(
                "ENERGY_TOMBSTONE_INTERVAL_TICKS",
                defaults.tombstone_interval_ticks as u64,
            ) as u32,
            idle_window_ticks: env_u64("ENERGY_IDLE_WINDOW_TICKS", defaults.idle_window_ticks as u64)
                as usize,
            expose_idle: env_bool("ENERGY_EXPOSE_IDLE", defaults.expose_idle),
            gpu_idle_power_uw: std::env::var("ENERGY_GPU_IDLE_POWER_UW")
                .ok()
                .and_then(|v| v.parse().ok()),
            core_usage_metric: UsageMetricChoice::from_env(
                "ENERGY_CORE_USAGE_METRIC",
                defaults.core_usage_metric,
            ),
            dram_usage_metric: UsageMetricChoice::from_env(
                "ENERGY_DRAM_USAGE_METRIC",
                defaults.dram_usage_metric,
            ),
            uncore_usage_metric: UsageMetricChoice::from_env(
                "ENERGY_UNCORE_USAGE_METRIC",
                defaults.uncore_usage_metric,
            ),
            platform_usage_metric: UsageMetricChoice::from_env(
                "ENERGY_PLATFORM_USAGE_METRIC",
                defaults.platform_usage_metric,
            ),
            multi_tenant_opaque: env_bool(
                "ENERGY_MULTI_TENANT_OPAQUE",
                defaults.multi_tenant_opaque,
            ),
            backend_timeout_ms: env_u64("ENERGY_BACKEND_TIMEOUT_MS", defaults.backend_timeout_ms),
        }
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = Config::default();
        assert_eq!(c.sample_period_sec, 3);
        assert_eq!(c.staleness_threshold_sec, 10);
        assert_eq!(c.tombstone_interval_ticks, 1);
        assert_eq!(c.idle_window_ticks, 60);
        assert!(!c.expose_idle);
        assert!(c.gpu_idle_power_uw.is_none());
    }

    #[test]
    fn usage_metric_choice_parses_empty_as_even_split() {
        std::env::set_var("ENERGY_TEST_UNCORE_METRIC", "empty");
        let choice = UsageMetricChoice::from_env(
            "ENERGY_TEST_UNCORE_METRIC",
            UsageMetricChoice::Metric(MetricKey::CpuTime),
        );
        assert_eq!(choice, UsageMetricChoice::EvenSplit);
        std::env::remove_var("ENERGY_TEST_UNCORE_METRIC");
    }
}
