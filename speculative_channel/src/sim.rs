//! A deterministic model of the micro-architecture the leak relies on.
//!
//! The model has a set-associative LRU data cache indexed by address bits
//! 6..11, a single 2-bit saturating branch predictor for the gadget, and a
//! cycle counter that every access advances and that drives a coarse clock.
//! A not-taken branch that was predicted taken while its compare load
//! missed runs the body transiently: the probe line is brought into the
//! cache and nothing else happens.
//!
//! It only models what the channel needs. Measurements on it are exactly
//! reproducible, which is what the test suite runs on.

use crate::gadget::{GadgetCall, SecretHolder, SpeculativePrimitives};
use cache_side_channel::CacheStatus;
use cache_utils::arena::ArenaLayout;
use cache_utils::ticks::TickSampler;
use cache_utils::{CellAccess, LINE_CELLS};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationConfig {
    pub hit_cycles: u64,
    pub miss_cycles: u64,
    /// Cost of one clock read.
    pub poll_cycles: u64,
    pub tick_cycles: u64,
    pub sets: usize,
    pub ways: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            hit_cycles: 4,
            miss_cycles: 200,
            poll_cycles: 10,
            tick_cycles: 5000,
            sets: 64,
            ways: 8,
        }
    }
}

impl SimulationConfig {
    /// A configuration matching `layout`: one way per flush page, so that
    /// one eviction pass exactly replaces the content of the targeted sets,
    /// and ticks long enough for four fully uncached probe walks.
    pub fn for_layout(layout: &ArenaLayout) -> SimulationConfig {
        let default = SimulationConfig::default();
        let pages = layout.probe_pages() as u64;
        let tick_cycles = default.tick_cycles.max(4 * pages * default.miss_cycles);
        SimulationConfig {
            ways: layout.flush_pages(),
            tick_cycles,
            poll_cycles: default.poll_cycles.max(tick_cycles / 500),
            ..default
        }
    }
}

/// LRU per set, most recently used line at the back.
#[derive(Debug, Clone)]
pub struct SimulatedCache {
    sets: Vec<VecDeque<usize>>,
    ways: usize,
}

impl SimulatedCache {
    pub fn new(sets: usize, ways: usize) -> SimulatedCache {
        let sets = sets.max(1);
        let ways = ways.max(1);
        SimulatedCache {
            sets: vec![VecDeque::with_capacity(ways); sets],
            ways,
        }
    }

    pub fn line_of(index: usize) -> usize {
        index / LINE_CELLS
    }

    fn set_of(&self, line: usize) -> usize {
        line % self.sets.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        let line = Self::line_of(index);
        self.sets[self.set_of(line)].contains(&line)
    }

    pub fn access(&mut self, index: usize) -> CacheStatus {
        let line = Self::line_of(index);
        let ways = self.ways;
        let set = self.set_of(line);
        let set = &mut self.sets[set];
        if let Some(position) = set.iter().position(|l| *l == line) {
            set.remove(position);
            set.push_back(line);
            CacheStatus::Hit
        } else {
            if set.len() == ways {
                set.pop_front();
            }
            set.push_back(line);
            CacheStatus::Miss
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedCore {
    config: SimulationConfig,
    cache: SimulatedCache,
    cycles: u64,
    // 2-bit saturating counter, taken when >= 2.
    predictor: u8,
    transient_loads: u64,
}

impl SimulatedCore {
    pub fn new(config: SimulationConfig) -> SimulatedCore {
        SimulatedCore {
            cache: SimulatedCache::new(config.sets, config.ways),
            config,
            cycles: 0,
            predictor: 1,
            transient_loads: 0,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_cached(&self, index: usize) -> bool {
        self.cache.contains(index)
    }

    pub fn predicts_taken(&self) -> bool {
        self.predictor >= 2
    }

    /// Number of probe lines brought in under misprediction so far.
    pub fn transient_loads(&self) -> u64 {
        self.transient_loads
    }

    fn latency(&self, status: CacheStatus) -> u64 {
        match status {
            CacheStatus::Hit => self.config.hit_cycles,
            CacheStatus::Miss => self.config.miss_cycles,
        }
    }

    fn train_predictor(&mut self, taken: bool) {
        self.predictor = if taken {
            (self.predictor + 1).min(3)
        } else {
            self.predictor.saturating_sub(1)
        };
    }
}

impl CellAccess for SimulatedCore {
    fn load(&mut self, cells: &[u32], index: usize) -> u32 {
        let status = self.cache.access(index);
        self.cycles += self.latency(status);
        cells[index]
    }
}

impl TickSampler for SimulatedCore {
    fn now(&mut self) -> u64 {
        self.cycles += self.config.poll_cycles;
        self.cycles / self.config.tick_cycles
    }
}

impl SpeculativePrimitives for SimulatedCore {
    fn probe(&mut self, cells: &[u32], call: &GadgetCall, secret: &SecretHolder) -> u32 {
        // The secret holder stays resident, it is not part of the modelled cache.
        let warm = secret.read(crate::gadget::WARM_CELL);
        self.cycles += self.config.hit_cycles;
        self.now();

        let status = self.cache.access(call.compare_index);
        self.cycles += self.latency(status);
        let taken = cells[call.compare_index] < call.mode.threshold();
        let predicted = self.predicts_taken();

        let bit = (secret.read(call.read_index) >> call.bit) & 1;
        let index = call.probe_index(bit);
        let mut t = warm.wrapping_mul(call.bit);
        if taken {
            t = self.load(cells, index).wrapping_add(t);
        } else if predicted && status == CacheStatus::Miss {
            self.cache.access(index);
            self.transient_loads += 1;
        }
        self.train_predictor(taken);
        t
    }
}
