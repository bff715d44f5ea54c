//! Turns busy-loop counts into bit decisions.
//!
//! A cached probe chain walks faster, so more polls fit before the next
//! clock edge. The half touched by the gadget therefore yields the larger
//! mean count, and `mean(zero) / mean(one)` rises above the no-signal level
//! when the leaked bit is 0 and falls below it when the bit is 1.
//!
//! The no-signal level is not exactly 1 on real platforms, so the decision
//! threshold is always supplied by the caller.

use serde::{Deserialize, Serialize};

pub const WORD_BITS: usize = 32;

pub fn mean(counts: &[u64]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    counts.iter().map(|c| *c as f64).sum::<f64>() / counts.len() as f64
}

/// `mean(zero) / mean(one)`.
///
/// Both means at zero give NaN, which `decide` maps to 1.
pub fn ratio(zero_counts: &[u64], one_counts: &[u64]) -> f64 {
    mean(zero_counts) / mean(one_counts)
}

/// 0 if `ratio > threshold`, 1 otherwise (including the boundary).
pub fn decide(ratio: f64, threshold: f64) -> u32 {
    if ratio > threshold {
        0
    } else {
        1
    }
}

/// One ratio per (repeat, bit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioTable {
    repeats: usize,
    ratios: Vec<f64>,
}

impl RatioTable {
    pub fn new(repeats: usize) -> RatioTable {
        RatioTable {
            repeats,
            ratios: vec![f64::NAN; repeats * WORD_BITS],
        }
    }

    pub fn repeats(&self) -> usize {
        self.repeats
    }

    pub fn record(&mut self, repeat: usize, bit: usize, ratio: f64) {
        self.ratios[repeat * WORD_BITS + bit] = ratio;
    }

    pub fn get(&self, repeat: usize, bit: usize) -> f64 {
        self.ratios[repeat * WORD_BITS + bit]
    }

    pub fn reset(&mut self) {
        self.ratios.fill(f64::NAN);
    }

    pub fn average(&self, bit: usize) -> f64 {
        let sum: f64 = (0..self.repeats).map(|r| self.get(r, bit)).sum();
        sum / self.repeats as f64
    }

    /// Averaged ratios, indexed by bit number.
    pub fn averages(&self) -> Vec<f64> {
        (0..WORD_BITS).map(|bit| self.average(bit)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitDiscriminator {
    pub threshold: f64,
}

impl BitDiscriminator {
    pub fn new(threshold: f64) -> BitDiscriminator {
        BitDiscriminator { threshold }
    }

    pub fn decide(&self, ratio: f64) -> u32 {
        decide(ratio, self.threshold)
    }

    /// Builds the restored word, deciding bit 31 first.
    pub fn assemble(&self, table: &RatioTable) -> u32 {
        let mut value = 0u32;
        for bit in (0..WORD_BITS).rev() {
            value = (value << 1) | self.decide(table.average(bit));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_field::BitField;

    #[test]
    fn decide_boundaries() {
        for threshold in [0.5, 0.95, 1.0, 1.05, 2.0] {
            assert_eq!(decide(threshold + 0.01, threshold), 0);
            assert_eq!(decide(threshold * 10.0, threshold), 0);
            assert_eq!(decide(threshold, threshold), 1);
            assert_eq!(decide(threshold - 0.01, threshold), 1);
            assert_eq!(decide(0.0, threshold), 1);
        }
        assert_eq!(decide(f64::INFINITY, 1.0), 0);
        assert_eq!(decide(f64::NAN, 1.0), 1);
    }

    #[test]
    fn ratio_of_means() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[2, 4, 6]), 4.0);
        assert_eq!(ratio(&[120, 80], &[50, 50]), 2.0);
        assert!(ratio(&[0, 0], &[0, 0]).is_nan());
    }

    #[test]
    fn assemble_msb_first() {
        let secret = 0b1011_0000_0000_0000_0000_0000_0000_0110u32;
        let mut table = RatioTable::new(1);
        for bit in 0..WORD_BITS {
            let ratio = if secret.get_bit(bit) { 0.9 } else { 1.1 };
            table.record(0, bit, ratio);
        }
        let discriminator = BitDiscriminator::new(1.0);
        assert_eq!(discriminator.assemble(&table), secret);
    }

    #[test]
    fn repeats_are_averaged() {
        let mut table = RatioTable::new(3);
        table.record(0, 5, 1.3);
        table.record(1, 5, 0.8);
        table.record(2, 5, 0.9);
        assert!((table.average(5) - 1.0).abs() < 1e-9);
        // A bit never recorded stays undecided as NaN and decodes as 1.
        assert!(table.average(6).is_nan());
        let value = BitDiscriminator::new(0.99).assemble(&table);
        assert!(!value.get_bit(5));
        assert!(value.get_bit(6));
    }
}
