#![deny(unsafe_op_in_unsafe_fn)]

// Evaluation of the speculative leak: run the same orchestrator many times,
// compare every restored word with the secret it was leaking, and time the
// whole thing to get a leak rate.

use cache_side_channel::discriminator::WORD_BITS;
use num_rational::Rational64;
use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use speculative_channel::{LeakParameters, RunReport, SpeculativePrimitives, TrialOrchestrator};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitErrors {
    pub true_zero: usize,
    pub true_one: usize,
    pub false_one: usize,
    pub false_zero: usize,
}

impl BitErrors {
    pub fn from_values(secret: u32, restored: u32) -> BitErrors {
        BitErrors {
            true_zero: (!secret & !restored).count_ones() as usize,
            true_one: (secret & restored).count_ones() as usize,
            false_one: (!secret & restored).count_ones() as usize,
            false_zero: (secret & !restored).count_ones() as usize,
        }
    }

    pub fn from_report(report: &RunReport) -> BitErrors {
        Self::from_values(report.secret, report.restored)
    }

    pub fn bits_leaked(&self) -> usize {
        self.true_one + self.false_one + self.true_zero + self.false_zero
    }

    pub fn one_restored(&self) -> usize {
        self.true_one + self.false_one
    }

    pub fn zero_restored(&self) -> usize {
        self.true_zero + self.false_zero
    }

    pub fn one_in_secret(&self) -> usize {
        self.true_one + self.false_zero
    }

    pub fn zero_in_secret(&self) -> usize {
        self.true_zero + self.false_one
    }

    pub fn bit_error(&self) -> usize {
        self.false_zero + self.false_one
    }

    pub fn error_rate(&self) -> f64 {
        self.bit_error() as f64 / self.bits_leaked() as f64
    }

    pub fn error_ratio(&self) -> Rational64 {
        Rational64::new(self.bit_error() as i64, self.bits_leaked() as i64)
    }
}

impl AddAssign<&Self> for BitErrors {
    fn add_assign(&mut self, rhs: &Self) {
        self.true_zero += rhs.true_zero;
        self.true_one += rhs.true_one;
        self.false_zero += rhs.false_zero;
        self.false_one += rhs.false_one;
    }
}

impl AddAssign<Self> for BitErrors {
    fn add_assign(&mut self, rhs: Self) {
        *self += &rhs;
    }
}

impl Add for BitErrors {
    type Output = BitErrors;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Add<&Self> for BitErrors {
    type Output = BitErrors;

    fn add(mut self, rhs: &Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sum<Self> for BitErrors {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(BitErrors::default(), |a, b| a + b)
    }
}

impl<'a> Sum<&'a Self> for BitErrors {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(BitErrors::default(), |a, b| a + b)
    }
}

/// Which secret each run of a benchmark leaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretSchedule {
    Fixed(u32),
    Random,
}

impl SecretSchedule {
    pub fn next_secret(&self) -> u32 {
        match self {
            SecretSchedule::Fixed(secret) => *secret,
            SecretSchedule::Random => rand::random(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeakBenchmarkResult {
    pub runs: usize,
    pub exact_runs: usize,
    pub errors: BitErrors,
    pub duration: Duration,
    pub params: LeakParameters,
    pub reports: Vec<RunReport>,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl LeakBenchmarkResult {
    pub const EXTENSION_ZSTD: &'static str = "LBR.msgpack.zst";

    pub fn exact_rate(&self) -> f64 {
        self.exact_runs as f64 / self.runs as f64
    }

    pub fn error_rate(&self) -> f64 {
        self.errors.error_rate()
    }

    pub fn error_ratio(&self) -> Rational64 {
        self.errors.error_ratio()
    }

    pub fn bits_per_second(&self) -> f64 {
        (self.runs * WORD_BITS) as f64 / self.duration.as_secs_f64()
    }

    /// Leak rate corrected for errors, as a binary symmetric channel.
    pub fn true_bits_per_second(&self) -> f64 {
        let p = self.error_rate();
        if p == 0.0 || p == 1.0 {
            self.bits_per_second() * (1.0 - 2.0 * p).abs()
        } else {
            self.bits_per_second() * (1.0 + ((1.0 - p) * f64::log2(1.0 - p) + p * f64::log2(p)))
        }
    }

    pub fn csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.runs,
            self.exact_runs,
            self.errors.bit_error(),
            self.error_rate(),
            self.duration.as_nanos(),
            self.bits_per_second()
        )
    }

    pub fn csv_header() -> String {
        "runs,exact_runs,bits_error,error_rate,time_nanosec,bits_per_second".to_string()
    }

    pub fn read_msgpack(path: impl AsRef<std::path::Path>) -> Result<Self, PersistError> {
        let buf = std::fs::read(path)?;
        let mut decoder = zstd::Decoder::new(&buf[..])?;
        let mut deserializer = Deserializer::new(&mut decoder);
        Ok(LeakBenchmarkResult::deserialize(&mut deserializer)?)
    }

    pub fn write_msgpack(&self, path: impl AsRef<std::path::Path>) -> Result<(), PersistError> {
        let f1 = std::fs::File::create(path)?;
        let mut encoder = zstd::Encoder::new(f1, 0)?.auto_finish();
        let mut s = Serializer::new(&mut encoder);
        self.serialize(&mut s)?;
        Ok(())
    }
}

/// Leaks `runs` secrets with the same orchestrator.
pub fn benchmark_leak<P: SpeculativePrimitives>(
    orchestrator: &mut TrialOrchestrator<P>,
    runs: usize,
    schedule: SecretSchedule,
) -> LeakBenchmarkResult {
    let mut reports = Vec::with_capacity(runs);
    let start = Instant::now();
    for _ in 0..runs {
        let secret = schedule.next_secret();
        reports.push(orchestrator.run_secret(secret));
    }
    let duration = start.elapsed();
    let errors: BitErrors = reports.iter().map(BitErrors::from_report).sum();
    let exact_runs = reports.iter().filter(|r| r.is_exact()).count();
    log::info!(
        "{} runs, {} exact, {} bit errors in {:?}",
        runs,
        exact_runs,
        errors.bit_error(),
        duration
    );
    LeakBenchmarkResult {
        runs,
        exact_runs,
        errors,
        duration,
        params: orchestrator.params().clone(),
        reports,
    }
}

/// Mean and variance of the error rate, raw and corrected leak rates over
/// several benchmark sessions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStats {
    pub average_p: f64,
    pub var_p: f64,
    pub average_c: f64,
    pub var_c: f64,
    pub average_t: f64,
    pub var_t: f64,
}

impl BenchmarkStats {
    pub fn from_results(results: &[LeakBenchmarkResult]) -> BenchmarkStats {
        let n = results.len() as f64;
        let mut average_p = 0.0;
        let mut average_c = 0.0;
        let mut average_t = 0.0;
        for result in results {
            average_p += result.error_rate();
            average_c += result.bits_per_second();
            average_t += result.true_bits_per_second();
        }
        average_p /= n;
        average_c /= n;
        average_t /= n;
        let mut var_p = 0.0;
        let mut var_c = 0.0;
        let mut var_t = 0.0;
        for result in results {
            let p = result.error_rate() - average_p;
            var_p += p * p;
            let c = result.bits_per_second() - average_c;
            var_c += c * c;
            let t = result.true_bits_per_second() - average_t;
            var_t += t * t;
        }
        BenchmarkStats {
            average_p,
            var_p: var_p / n,
            average_c,
            var_c: var_c / n,
            average_t,
            var_t: var_t / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_field::BitField;
    use speculative_channel::sim::{SimulatedCore, SimulationConfig};

    #[test]
    fn bit_errors_classify_every_bit() {
        let secret = 0b1100u32;
        let restored = 0b1010u32;
        let errors = BitErrors::from_values(secret, restored);
        assert_eq!(errors.true_one, 1);
        assert_eq!(errors.false_zero, 1);
        assert_eq!(errors.false_one, 1);
        assert_eq!(errors.true_zero, 29);
        assert_eq!(errors.bits_leaked(), 32);
        assert_eq!(errors.error_ratio(), Rational64::new(1, 16));
        assert_eq!(errors.one_in_secret(), 2);
        assert_eq!(errors.one_restored(), 2);

        let mut expected_false = 0;
        for bit in 0..32 {
            if secret.get_bit(bit) != restored.get_bit(bit) {
                expected_false += 1;
            }
        }
        assert_eq!(errors.bit_error(), expected_false);
    }

    #[test]
    fn bit_errors_sum() {
        let all: BitErrors = [(0, 0), (u32::MAX, u32::MAX), (u32::MAX, 0)]
            .iter()
            .map(|(s, r)| BitErrors::from_values(*s, *r))
            .sum();
        assert_eq!(all.bits_leaked(), 96);
        assert_eq!(all.true_zero, 32);
        assert_eq!(all.true_one, 32);
        assert_eq!(all.false_zero, 32);
        assert_eq!(all.error_rate(), 1.0 / 3.0);
    }

    fn orchestrator(threshold: f64) -> TrialOrchestrator<SimulatedCore> {
        let params = LeakParameters::new(threshold)
            .with_sizes(1 << 13, 1 << 13)
            .with_iterations(3);
        let layout = params.layout().unwrap();
        TrialOrchestrator::new(params, SimulatedCore::new(SimulationConfig::for_layout(&layout)))
            .unwrap()
    }

    #[test]
    fn benchmark_counts_exact_runs() {
        let mut o = orchestrator(1.0);
        let result = benchmark_leak(&mut o, 3, SecretSchedule::Random);
        assert_eq!(result.runs, 3);
        assert_eq!(result.exact_runs, 3);
        assert_eq!(result.errors.bit_error(), 0);
        assert_eq!(result.exact_rate(), 1.0);
        assert_eq!(result.reports.len(), 3);
        assert!(result.bits_per_second() > 0.0);
        assert_eq!(result.true_bits_per_second(), result.bits_per_second());
    }

    #[test]
    fn miscalibrated_threshold_is_counted() {
        // Every ratio is below this threshold: everything decodes as 1.
        let mut o = orchestrator(100.0);
        let result = benchmark_leak(&mut o, 2, SecretSchedule::Fixed(0x0000_00FF));
        assert_eq!(result.exact_runs, 0);
        assert_eq!(result.errors.false_one, 2 * 24);
        assert_eq!(result.errors.true_one, 2 * 8);
        assert_eq!(result.error_ratio(), Rational64::new(3, 4));
        assert_eq!(result.csv().split(',').count(), LeakBenchmarkResult::csv_header().split(',').count());
    }

    #[test]
    fn results_survive_msgpack_zstd() {
        let mut o = orchestrator(1.0);
        let result = benchmark_leak(&mut o, 1, SecretSchedule::Fixed(42));
        let path = std::env::temp_dir().join(format!(
            "leak_evaluation_{}.{}",
            std::process::id(),
            LeakBenchmarkResult::EXTENSION_ZSTD
        ));
        result.write_msgpack(&path).unwrap();
        let read = LeakBenchmarkResult::read_msgpack(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read.errors, result.errors);
        assert_eq!(read.params, result.params);
        assert_eq!(read.reports[0].restored, 42);
    }

    #[test]
    fn stats_over_sessions() {
        let mut o = orchestrator(1.0);
        let results: Vec<_> = (0..2)
            .map(|_| benchmark_leak(&mut o, 1, SecretSchedule::Random))
            .collect();
        let stats = BenchmarkStats::from_results(&results);
        assert_eq!(stats.average_p, 0.0);
        assert_eq!(stats.var_p, 0.0);
        assert!(stats.average_c > 0.0);
    }
}
