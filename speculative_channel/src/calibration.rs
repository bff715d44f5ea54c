//! Measures where the decision threshold should sit on this machine.
//!
//! Leaking an all-zero word gives the ratio of the "bit is 0" regime on
//! every bit, an all-one word that of the "bit is 1" regime. The proposed
//! threshold is the midpoint of the two mean ratios.

use crate::gadget::SpeculativePrimitives;
use crate::orchestrator::{RunReport, TrialOrchestrator};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    NoOutput,
    Thresholds,
    RawResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCalibration {
    pub zero_mean: f64,
    pub one_mean: f64,
    pub threshold: f64,
    /// Lowest zero-regime ratio minus highest one-regime ratio. Not
    /// positive when the regimes overlap, NaN when a regime has no finite
    /// ratio.
    pub margin: f64,
}

impl ThresholdCalibration {
    pub fn separates(&self) -> bool {
        self.margin > 0.0
    }
}

fn finite_ratios(report: &RunReport) -> Vec<f64> {
    report.ratios.iter().copied().filter(|r| r.is_finite()).collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn calibrate_threshold<P: SpeculativePrimitives>(
    orchestrator: &mut TrialOrchestrator<P>,
    verbosity: Verbosity,
) -> ThresholdCalibration {
    let zeros = orchestrator.run_secret(0);
    let ones = orchestrator.run_secret(u32::MAX);
    let zero_ratios = finite_ratios(&zeros);
    let one_ratios = finite_ratios(&ones);

    if verbosity == Verbosity::RawResult {
        println!(
            "zero regime: {}",
            zero_ratios.iter().map(|r| format!("{:.4}", r)).join(" ")
        );
        println!(
            "one regime: {}",
            one_ratios.iter().map(|r| format!("{:.4}", r)).join(" ")
        );
    }

    let zero_mean = mean(&zero_ratios);
    let one_mean = mean(&one_ratios);
    let margin = if zero_ratios.is_empty() || one_ratios.is_empty() {
        log::warn!("no finite ratio in a regime, every walk overran a clock tick");
        f64::NAN
    } else {
        let lowest_zero = zero_ratios.iter().copied().fold(f64::INFINITY, f64::min);
        let highest_one = one_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        lowest_zero - highest_one
    };
    let calibration = ThresholdCalibration {
        zero_mean,
        one_mean,
        threshold: (zero_mean + one_mean) / 2.0,
        margin,
    };

    if verbosity != Verbosity::NoOutput {
        println!(
            "zero mean: {:.4}, one mean: {:.4}, threshold: {:.4}, margin: {:.4}",
            calibration.zero_mean, calibration.one_mean, calibration.threshold, calibration.margin
        );
    }
    if !calibration.separates() {
        log::warn!(
            "ratio regimes overlap (margin {:.4}), no threshold decodes reliably",
            calibration.margin
        );
    }
    calibration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::GadgetMode;
    use crate::params::LeakParameters;
    use crate::sim::{SimulatedCore, SimulationConfig};

    fn orchestrator(mode: GadgetMode) -> TrialOrchestrator<SimulatedCore> {
        let params = LeakParameters::new(1.0)
            .with_sizes(1 << 13, 1 << 13)
            .with_iterations(5)
            .with_mode(mode);
        let layout = params.layout().unwrap();
        TrialOrchestrator::new(params, SimulatedCore::new(SimulationConfig::for_layout(&layout)))
            .unwrap()
    }

    #[test]
    fn speculative_regimes_separate() {
        let mut orchestrator = orchestrator(GadgetMode::Speculative);
        let calibration = calibrate_threshold(&mut orchestrator, Verbosity::NoOutput);
        assert!(calibration.separates());
        assert!(calibration.zero_mean > 1.0);
        assert!(calibration.one_mean < 1.0);
        assert!(calibration.threshold > calibration.one_mean);
        assert!(calibration.threshold < calibration.zero_mean);

        orchestrator.set_threshold(calibration.threshold).unwrap();
        assert_eq!(orchestrator.run_secret(0x5A5A_A5A5).restored, 0x5A5A_A5A5);
    }

    #[test]
    fn disabled_regimes_overlap() {
        let mut orchestrator = orchestrator(GadgetMode::Disabled);
        let calibration = calibrate_threshold(&mut orchestrator, Verbosity::NoOutput);
        // Both regimes are the same measurement, up to clock phase.
        assert!(calibration.margin < 0.01);
        assert!((calibration.threshold - 1.0).abs() < 0.05);
    }

    #[test]
    fn overrunning_walks_do_not_separate() {
        let params = LeakParameters::new(1.0)
            .with_sizes(1 << 13, 1 << 13)
            .with_iterations(5)
            .with_mode(GadgetMode::Speculative);
        let layout = params.layout().unwrap();
        // A tick shorter than a single cached walk: no walk ends inside a tick.
        let config = SimulationConfig {
            tick_cycles: 20,
            poll_cycles: 10,
            ..SimulationConfig::for_layout(&layout)
        };
        let mut orchestrator =
            TrialOrchestrator::new(params, SimulatedCore::new(config)).unwrap();
        let calibration = calibrate_threshold(&mut orchestrator, Verbosity::NoOutput);
        assert!(calibration.threshold.is_nan());
        assert!(calibration.margin.is_nan());
        assert!(!calibration.separates());
    }
}
