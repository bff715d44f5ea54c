use cache_utils::ticks::TickSampler;
use cache_utils::{barrier, maccess, CellAccess, VolatileAccess};
use core::fmt;
use core::hint::black_box;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Compare values in the compare region are all above this.
pub const COMPARE_THRESHOLD: u32 = 1000;

pub const WARM_CELL: usize = 0;
pub const SECRET_CELL: usize = 1;

/// How the gadget's comparison behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GadgetMode {
    /// The real comparison always fails: the probe line is only ever
    /// touched under misprediction.
    Speculative,
    /// The comparison always succeeds: the probe line is touched
    /// architecturally. Positive control.
    Architectural,
    /// The comparison never succeeds, not even during training. Negative
    /// control: no signal is expected.
    Disabled,
}

impl GadgetMode {
    pub fn threshold(self) -> u32 {
        match self {
            GadgetMode::Speculative => COMPARE_THRESHOLD,
            GadgetMode::Architectural => u32::MAX,
            GadgetMode::Disabled => 0,
        }
    }
}

impl From<bool> for GadgetMode {
    fn from(speculative: bool) -> Self {
        if speculative {
            GadgetMode::Speculative
        } else {
            GadgetMode::Disabled
        }
    }
}

impl fmt::Display for GadgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GadgetMode::Speculative => "speculative",
            GadgetMode::Architectural => "architectural",
            GadgetMode::Disabled => "disabled",
        })
    }
}

impl FromStr for GadgetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "speculative" => Ok(GadgetMode::Speculative),
            "architectural" => Ok(GadgetMode::Architectural),
            "disabled" => Ok(GadgetMode::Disabled),
            other => Err(format!(
                "unknown mode {:?}, expected speculative, architectural or disabled",
                other
            )),
        }
    }
}

/// Holds the leaked value. Cell 0 is warmed up before each branch and also
/// serves as the all-zero value read during training.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct SecretHolder {
    cells: [u32; 2],
}

impl SecretHolder {
    pub fn new(secret: u32) -> SecretHolder {
        SecretHolder { cells: [0, secret] }
    }

    pub fn secret(&self) -> u32 {
        self.cells[SECRET_CELL]
    }

    pub fn read(&self, index: usize) -> u32 {
        unsafe { maccess(&self.cells[index]) }
    }
}

/// Arguments of one gadget invocation, all offsets in arena cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GadgetCall {
    pub compare_index: usize,
    pub probe_base: usize,
    pub probe_offset: usize,
    pub half_stride: usize,
    pub read_index: usize,
    pub bit: u32,
    pub mode: GadgetMode,
}

impl GadgetCall {
    pub fn probe_index(&self, bit_value: u32) -> usize {
        self.probe_base + self.probe_offset + self.half_stride * bit_value as usize
    }
}

/// Everything a trial needs from the machine: loads, a coarse clock and
/// the speculative gadget.
pub trait SpeculativePrimitives: CellAccess + TickSampler {
    /// Runs the gadget once. The returned value carries no meaning and only
    /// has to be consumed.
    fn probe(&mut self, cells: &[u32], call: &GadgetCall, secret: &SecretHolder) -> u32;
}

/// The gadget.
///
/// Never inlined: training and probing must go through the very same
/// branch instruction to share one predictor entry.
#[inline(never)]
pub fn speculative_access<C: TickSampler + ?Sized>(
    clock: &mut C,
    cells: &[u32],
    call: &GadgetCall,
    secret: &SecretHolder,
) -> u32 {
    let mut t = secret.read(WARM_CELL).wrapping_mul(call.bit);
    black_box(clock.now());
    barrier();
    // The compare cell is uncached on the real call, so this branch is
    // predicted long before it resolves.
    if unsafe { maccess(&cells[call.compare_index]) } < call.mode.threshold() {
        let bit = (secret.read(call.read_index) >> call.bit) & 1;
        let index = call.probe_index(bit);
        t = unsafe { maccess(&cells[index]) }.wrapping_add(t);
    }
    black_box(t)
}

/// Real memory and a real coarse clock.
#[derive(Debug, Clone)]
pub struct NativePrimitives<C: TickSampler> {
    clock: C,
}

impl<C: TickSampler> NativePrimitives<C> {
    pub fn new(clock: C) -> NativePrimitives<C> {
        NativePrimitives { clock }
    }
}

impl<C: TickSampler> CellAccess for NativePrimitives<C> {
    #[inline(always)]
    fn load(&mut self, cells: &[u32], index: usize) -> u32 {
        VolatileAccess.load(cells, index)
    }
}

impl<C: TickSampler> TickSampler for NativePrimitives<C> {
    #[inline(always)]
    fn now(&mut self) -> u64 {
        self.clock.now()
    }
}

impl<C: TickSampler> SpeculativePrimitives for NativePrimitives<C> {
    fn probe(&mut self, cells: &[u32], call: &GadgetCall, secret: &SecretHolder) -> u32 {
        speculative_access(&mut self.clock, cells, call, secret)
    }
}
