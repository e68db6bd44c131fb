//! Node Energy Aggregator (§4.5): per-zone, per-tick raw-to-idle/dynamic
//! energy accounting with wrap detection.

use std::collections::VecDeque;

use tracing::warn;

use crate::backends::cpu::EnergyZoneReading;
use crate::error::EngineError;
use crate::identity::ZoneName;
use crate::snapshot::ZoneEnergy;

/// One zone's result for one tick: the published, monotonically
/// accumulating [`ZoneEnergy`] (§6's external field set — `absolute_uj`/
/// `idle_uj`/`dynamic_uj` are running totals, never reset) plus this
/// tick's own idle/dynamic split. §4.6 splits "node dynamic energy D_z
/// **at tick t**" across workloads, a per-tick quantity distinct from
/// the cumulative `dynamic_uj` accumulator — callers attributing energy
/// to processes must use `dynamic_this_tick_uj`, not `energy.dynamic_uj`.
#[derive(Debug, Clone, Copy)]
pub struct ZoneTickEnergy {
    pub energy: ZoneEnergy,
    pub idle_this_tick_uj: u64,
    pub dynamic_this_tick_uj: u64,
}

/// Per-zone running state the aggregator owns across ticks (§3 Energy
/// Zone: "index, last raw reading, max raw value, running accumulated
/// energy counter").
#[derive(Debug, Clone)]
pub struct ZoneState {
    pub zone: ZoneName,
    pub socket_index: u32,
    last_raw_uj: Option<u64>,
    max_raw_uj: u64,
    total_energy_uj: u64,
    idle_accumulator_uj: u64,
    /// Sliding window of the last N *non-zero* deltas, used to derive the
    /// per-tick idle baseline (§4.5 step 4).
    recent_nonzero_deltas: VecDeque<u64>,
    window_size: usize,
    last_delta_uj: u64,
}

impl ZoneState {
    pub fn new(zone: ZoneName, socket_index: u32, max_raw_uj: u64, window_size: usize) -> Self {
        Self {
            zone,
            socket_index,
            last_raw_uj: None,
            max_raw_uj,
            total_energy_uj: 0,
            idle_accumulator_uj: 0,
            recent_nonzero_deltas: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
            last_delta_uj: 0,
        }
    }

    /// Apply one tick's raw reading, returning the tick's contribution
    /// and any wrap-related degradation to log (§4.5 steps 1–5, §8
    /// boundary "raw energy wrap").
    fn apply(&mut self, raw_now_uj: u64) -> Result<ZoneTickEnergy, EngineError> {
        let delta = match self.last_raw_uj {
            None => 0, // first reading for this zone: no prior value to diff against
            Some(prev) => {
                // True modular subtraction (not u64-wrapping subtraction):
                // a wrapped counter's delta is "how far past the wrap
                // boundary plus how far the new reading has climbed since",
                // not the two's-complement difference in u64 space (§4.5
                // step 2, §8 "raw energy wrap" boundary behavior).
                let raw_delta = if raw_now_uj >= prev {
                    raw_now_uj - prev
                } else {
                    (self.max_raw_uj - prev) + raw_now_uj
                };
                if raw_delta > self.max_raw_uj / 2 {
                    // A delta bigger than half the wrap range is treated
                    // as a missed sample, not a real reading (§4.5, §7
                    // WrapImplausible).
                    warn!(zone = %self.zone, delta = raw_delta, max = self.max_raw_uj, "implausible wrap, treating as missed sample");
                    self.last_raw_uj = Some(raw_now_uj);
                    return Err(EngineError::WrapImplausible {
                        zone: self.zone,
                        delta: raw_delta,
                        max_raw: self.max_raw_uj,
                    });
                }
                raw_delta
            }
        };

        self.last_raw_uj = Some(raw_now_uj);
        self.last_delta_uj = delta;
        self.total_energy_uj += delta;

        if delta > 0 {
            if self.recent_nonzero_deltas.len() == self.window_size {
                self.recent_nonzero_deltas.pop_front();
            }
            self.recent_nonzero_deltas.push_back(delta);
        }

        let min_delta = self.recent_nonzero_deltas.iter().copied().min().unwrap_or(0);
        let idle_this_tick = delta.min(min_delta);
        self.idle_accumulator_uj += idle_this_tick;
        let dynamic_this_tick = delta - idle_this_tick;

        Ok(ZoneTickEnergy {
            energy: ZoneEnergy {
                absolute_uj: self.total_energy_uj,
                idle_uj: self.idle_accumulator_uj,
                dynamic_uj: self.total_energy_uj - self.idle_accumulator_uj,
                delta_this_tick_uj: delta,
            },
            idle_this_tick_uj: idle_this_tick,
            dynamic_this_tick_uj: dynamic_this_tick,
        })
    }

    pub fn last_delta(&self) -> u64 {
        self.last_delta_uj
    }
}

/// Drives every known zone's [`ZoneState`] through one tick's readings.
#[derive(Debug, Default)]
pub struct NodeEnergyAggregator {
    zones: std::collections::HashMap<(ZoneName, u32), ZoneState>,
    window_size: usize,
}

impl NodeEnergyAggregator {
    pub fn new(window_size: usize) -> Self {
        Self {
            zones: std::collections::HashMap::new(),
            window_size: window_size.max(1),
        }
    }

    /// Apply one tick of raw zone readings, returning each zone's
    /// computed energy plus any wrap-related errors encountered (§4.5,
    /// §7). A zone absent from `readings` this tick is left untouched,
    /// its last published values simply aren't refreshed (§5 failure
    /// isolation: "the affected zone/device is omitted from this tick's
    /// snapshot").
    pub fn tick(
        &mut self,
        readings: &[EnergyZoneReading],
    ) -> (Vec<(ZoneName, ZoneTickEnergy)>, Vec<EngineError>) {
        let mut results = Vec::new();
        let mut errors = Vec::new();

        for reading in readings {
            let key = (reading.zone, reading.socket_index);
            let window_size = self.window_size;
            let state = self.zones.entry(key).or_insert_with(|| {
                ZoneState::new(reading.zone, reading.socket_index, reading.max_raw_uj, window_size)
            });

            match state.apply(reading.raw_energy_uj) {
                Ok(energy) => results.push((reading.zone, energy)),
                Err(err) => errors.push(err),
            }
        }

        (results, errors)
    }

    pub fn zone_state(&self, zone: ZoneName, socket_index: u32) -> Option<&ZoneState> {
        self.zones.get(&(zone, socket_index))
    }
}
