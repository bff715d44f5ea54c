//! Coarse clocks and edge counting.
//!
//! The clocks available to the measurement are assumed to be coarse (tens
//! of microseconds or worse), far too coarse to time a single memory access.
//! Instead of timing the accesses directly, a measurement waits for a clock
//! edge, performs the accesses, then counts busy-loop iterations until the
//! next edge: the slower the accesses, the fewer iterations fit before the
//! edge.
//!
//! This only works while a whole measured access sequence fits inside one
//! tick with room left for counting. Nothing checks this at runtime;
//! `measure_resolution` reports the numbers needed to check it by hand.

use core::hint::spin_loop;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

pub trait TickSampler {
    /// Current clock value, in ticks.
    fn now(&mut self) -> u64;

    /// Spins until the clock value changes and returns the new value.
    fn wait_for_edge(&mut self) -> u64 {
        let last = self.now();
        loop {
            let current = self.now();
            if current != last {
                return current;
            }
            spin_loop();
        }
    }

    /// Counts polls while the clock still reads `edge`.
    fn count_until_next_edge(&mut self, edge: u64) -> u64 {
        let mut count = 0;
        while self.now() == edge {
            count += 1;
        }
        count
    }
}

impl<T: TickSampler + ?Sized> TickSampler for &mut T {
    fn now(&mut self) -> u64 {
        (**self).now()
    }
}

/// Monotonic clock quantised to `resolution_ns` nanoseconds.
#[derive(Debug, Clone)]
pub struct CoarseClock {
    origin: Instant,
    resolution_ns: u64,
}

impl CoarseClock {
    pub fn new(resolution_ns: u64) -> CoarseClock {
        CoarseClock {
            origin: Instant::now(),
            resolution_ns: resolution_ns.max(1),
        }
    }

    pub fn resolution_ns(&self) -> u64 {
        self.resolution_ns
    }

    fn elapsed_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl TickSampler for CoarseClock {
    fn now(&mut self) -> u64 {
        self.elapsed_ns() / self.resolution_ns
    }
}

/// A `CoarseClock` whose edges are moved by a pseudo-random amount smaller
/// than one tick. The offset of each edge only depends on the seed and the
/// tick number, so the clock stays monotonic.
#[derive(Debug, Clone)]
pub struct JitteredClock {
    inner: CoarseClock,
    jitter_ns: u64,
    seed: u64,
}

impl JitteredClock {
    pub fn new(resolution_ns: u64, jitter_ns: u64) -> JitteredClock {
        Self::with_seed(resolution_ns, jitter_ns, rand::thread_rng().gen())
    }

    pub fn with_seed(resolution_ns: u64, jitter_ns: u64, seed: u64) -> JitteredClock {
        let inner = CoarseClock::new(resolution_ns);
        let jitter_ns = jitter_ns.min(inner.resolution_ns - 1);
        JitteredClock {
            inner,
            jitter_ns,
            seed,
        }
    }

    fn edge_offset(&self, tick: u64) -> u64 {
        if self.jitter_ns == 0 {
            0
        } else {
            SmallRng::seed_from_u64(self.seed ^ tick).gen_range(0..=self.jitter_ns)
        }
    }

    fn ticks_at(&self, elapsed_ns: u64) -> u64 {
        let resolution = self.inner.resolution_ns;
        let tick = elapsed_ns / resolution;
        if tick > 0 && elapsed_ns - tick * resolution < self.edge_offset(tick) {
            tick - 1
        } else {
            tick
        }
    }
}

impl TickSampler for JitteredClock {
    fn now(&mut self) -> u64 {
        self.ticks_at(self.inner.elapsed_ns())
    }
}

/// Tick length and busy-loop capacity of a clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionEstimate {
    pub mean_tick_ns: f64,
    pub mean_count_per_tick: f64,
    pub min_count_per_tick: u64,
}

/// Measures `samples` consecutive full ticks.
pub fn measure_resolution<T: TickSampler>(clock: &mut T, samples: usize) -> ResolutionEstimate {
    let samples = samples.max(1);
    let mut counts = Vec::with_capacity(samples);
    let mut edge = clock.wait_for_edge();
    let start = Instant::now();
    for _ in 0..samples {
        let count = clock.count_until_next_edge(edge);
        counts.push(count);
        edge = clock.now();
    }
    let elapsed = start.elapsed().as_nanos() as f64;
    ResolutionEstimate {
        mean_tick_ns: elapsed / samples as f64,
        mean_count_per_tick: counts.iter().sum::<u64>() as f64 / samples as f64,
        min_count_per_tick: counts.iter().copied().min().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Advances by one unit per poll and ticks every `period` units.
    struct StepClock {
        time: u64,
        period: u64,
    }

    impl TickSampler for StepClock {
        fn now(&mut self) -> u64 {
            self.time += 1;
            self.time / self.period
        }
    }

    #[test]
    fn wait_for_edge_returns_next_tick() {
        let mut clock = StepClock { time: 0, period: 10 };
        assert_eq!(clock.wait_for_edge(), 1);
        assert_eq!(clock.time, 10);
        assert_eq!(clock.wait_for_edge(), 2);
    }

    #[test]
    fn count_until_next_edge_counts_remaining_polls() {
        let mut clock = StepClock { time: 0, period: 10 };
        let edge = clock.wait_for_edge();
        assert_eq!(clock.count_until_next_edge(edge), 9);

        let edge = clock.wait_for_edge();
        // Simulated slow work eats part of the tick.
        clock.time += 6;
        assert_eq!(clock.count_until_next_edge(edge), 3);
    }

    #[test]
    fn jittered_clock_is_monotonic() {
        let clock = JitteredClock::with_seed(100, 60, 42);
        let mut last = 0;
        for t in 0..100_000 {
            let ticks = clock.ticks_at(t);
            assert!(ticks >= last);
            assert!(ticks <= last + 1);
            last = ticks;
        }
        assert!(last >= 999);
    }

    #[test]
    fn jitter_is_bounded_by_resolution() {
        let clock = JitteredClock::with_seed(100, 1000, 7);
        assert_eq!(clock.jitter_ns, 99);
        let unjittered = JitteredClock::with_seed(100, 0, 7);
        assert_eq!(unjittered.ticks_at(250), 2);
    }

    #[test]
    fn edge_offsets_depend_only_on_seed_and_tick() {
        let clock = JitteredClock::with_seed(100, 60, 42);
        let again = JitteredClock::with_seed(100, 60, 42);
        for tick in 1..1_000 {
            let offset = clock.edge_offset(tick);
            assert!(offset <= 60);
            assert_eq!(offset, again.edge_offset(tick));
        }
    }

    #[test]
    fn coarse_clock_advances() {
        let mut clock = CoarseClock::new(1_000);
        let edge = clock.wait_for_edge();
        assert!(clock.now() >= edge);
    }
}
