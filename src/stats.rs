//! Execution statistics: pass counters, per-opcode dispatch counts, and
//! the latency accumulator behind the engine's stats lock.

use rustc_hash::FxHashMap;
use std::time::Duration;

/// Mutable counters, guarded by a single exclusive lock in the engine.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    total_passes: u64,
    total_latency: Duration,
    per_opcode: FxHashMap<u8, u64>,
    unknown_opcodes: u64,
}

impl StatsInner {
    /// Count one kernel dispatch. `registered` is false when the opcode
    /// had no kernel and the dispatch no-opped.
    #[inline]
    pub fn record_dispatch(&mut self, op: u8, registered: bool) {
        *self.per_opcode.entry(op).or_insert(0) += 1;
        if !registered {
            self.unknown_opcodes += 1;
        }
    }

    /// Count one finished pass and fold in its wall time.
    #[inline]
    pub fn record_pass(&mut self, elapsed: Duration) {
        self.total_passes += 1;
        self.total_latency += elapsed;
    }

    /// Drop all counters back to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Immutable copy with derived figures.
    pub fn snapshot(&self, arena_utilization: f64) -> StatsSnapshot {
        let average_latency = if self.total_passes > 0 {
            self.total_latency / u32::try_from(self.total_passes).unwrap_or(u32::MAX)
        } else {
            Duration::ZERO
        };
        StatsSnapshot {
            total_passes: self.total_passes,
            average_latency,
            per_opcode_count: self.per_opcode.clone(),
            unknown_opcodes: self.unknown_opcodes,
            arena_utilization,
        }
    }
}

/// Read-only view of the engine's counters as of the last pass.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    /// Passes executed since construction (or the last reset).
    pub total_passes: u64,
    /// Mean wall time per pass.
    pub average_latency: Duration,
    /// Dispatch count per opcode, including unregistered ones.
    pub per_opcode_count: FxHashMap<u8, u64>,
    /// Dispatches that hit an empty registry slot and no-opped.
    pub unknown_opcodes: u64,
    /// Fraction of the arena in live use.
    pub arena_utilization: f64,
}
