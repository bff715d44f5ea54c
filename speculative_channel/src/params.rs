use crate::gadget::GadgetMode;
use crate::LeakError;
use cache_utils::arena::ArenaLayout;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROBE_SIZE: usize = 1 << 19;
pub const DEFAULT_FLUSH_SIZE: usize = 2 * (1 << 20);
pub const DEFAULT_ITERATIONS: usize = 500;
pub const DEFAULT_SECRET: u32 = 1717986918;
pub const DEFAULT_BIT_REPEAT: usize = 1;

/// Everything that configures a leak. Sizes are in arena cells.
///
/// The decision threshold has no default: the no-signal ratio depends on
/// the platform and has to be measured (see `calibration`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakParameters {
    pub flush_size: usize,
    pub probe_size: usize,
    pub iterations: usize,
    pub secret: u32,
    pub bit_repeat: usize,
    pub threshold: f64,
    pub mode: GadgetMode,
    pub huge_pages: bool,
}

impl LeakParameters {
    pub fn new(threshold: f64) -> LeakParameters {
        LeakParameters {
            flush_size: DEFAULT_FLUSH_SIZE,
            probe_size: DEFAULT_PROBE_SIZE,
            iterations: DEFAULT_ITERATIONS,
            secret: DEFAULT_SECRET,
            bit_repeat: DEFAULT_BIT_REPEAT,
            threshold,
            mode: GadgetMode::Speculative,
            huge_pages: false,
        }
    }

    pub fn with_sizes(mut self, flush_size: usize, probe_size: usize) -> Self {
        self.flush_size = flush_size;
        self.probe_size = probe_size;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_secret(mut self, secret: u32) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_bit_repeat(mut self, bit_repeat: usize) -> Self {
        self.bit_repeat = bit_repeat;
        self
    }

    pub fn with_mode(mut self, mode: GadgetMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn layout(&self) -> Result<ArenaLayout, LeakError> {
        Ok(ArenaLayout::new(self.flush_size, self.probe_size)?)
    }

    pub fn validate(&self) -> Result<ArenaLayout, LeakError> {
        if self.iterations == 0 {
            return Err(LeakError::NoIterations);
        }
        if self.bit_repeat == 0 {
            return Err(LeakError::NoRepeat);
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(LeakError::InvalidThreshold(self.threshold));
        }
        self.layout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::arena::LayoutError;

    #[test]
    fn defaults_are_valid() {
        let params = LeakParameters::new(1.0);
        let layout = params.validate().unwrap();
        assert_eq!(layout.probe_size, 1 << 19);
        assert_eq!(layout.flush_size, 1 << 21);
        assert_eq!(params.secret, 0x6666_6666);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let base = LeakParameters::new(1.0).with_sizes(8192, 8192);
        assert!(matches!(
            base.clone().with_iterations(0).validate(),
            Err(LeakError::NoIterations)
        ));
        assert!(matches!(
            base.clone().with_bit_repeat(0).validate(),
            Err(LeakError::NoRepeat)
        ));
        for threshold in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut params = base.clone();
            params.threshold = threshold;
            assert!(matches!(
                params.validate(),
                Err(LeakError::InvalidThreshold(_))
            ));
        }
        assert!(matches!(
            base.clone().with_sizes(8192, 1000).validate(),
            Err(LeakError::Layout(LayoutError::NotPageMultiple { .. }))
        ));
        assert!(matches!(
            base.with_sizes(0, 8192).validate(),
            Err(LeakError::Layout(LayoutError::Empty { .. }))
        ));
    }
}
