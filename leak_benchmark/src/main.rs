#![deny(unsafe_op_in_unsafe_fn)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cache_utils::ticks::{CoarseClock, JitteredClock};
use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};
use leak_evaluation::{benchmark_leak, BenchmarkStats, LeakBenchmarkResult, PersistError, SecretSchedule};
use speculative_channel::calibration::{calibrate_threshold, Verbosity};
use speculative_channel::params::{
    DEFAULT_BIT_REPEAT, DEFAULT_FLUSH_SIZE, DEFAULT_ITERATIONS, DEFAULT_PROBE_SIZE, DEFAULT_SECRET,
};
use speculative_channel::sim::{SimulatedCore, SimulationConfig};
use speculative_channel::{
    GadgetMode, LeakError, LeakParameters, NativePrimitives, RunReport, SpeculativePrimitives,
    TrialOrchestrator,
};
use thiserror::Error;

/// Leaks a 32 bit value through branch misprediction and cache timing,
/// measured with a coarse clock.
#[derive(Parser)]
#[command(version, verbatim_doc_comment)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Leak the secret and print the original and restored values.
    Leak {
        #[command(flatten)]
        options: LeakOptions,

        /// Ratio above which a bit decodes as 0.
        #[arg(long)]
        threshold: f64,

        /// Number of times the secret is leaked.
        #[arg(long, default_value_t = 1, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
        runs: usize,
    },
    /// Leak all-zero and all-one words and propose a threshold.
    Calibrate {
        #[command(flatten)]
        options: LeakOptions,

        /// Print every per-bit ratio.
        #[arg(long)]
        raw: bool,
    },
    /// Leak many words and report error rate and leak rate as CSV.
    Bench {
        #[command(flatten)]
        options: LeakOptions,

        /// Ratio above which a bit decodes as 0.
        #[arg(long)]
        threshold: f64,

        /// Leaks per session.
        #[arg(long, default_value_t = 32, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
        runs: usize,

        #[arg(long, default_value_t = 1, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
        sessions: usize,

        /// Leak a fresh random word on every run instead of --secret.
        #[arg(long)]
        random_secret: bool,

        /// Directory in which every session result is saved.
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Real memory and a real clock.
    Native,
    /// The deterministic cache and predictor model. Slow with large sizes.
    Simulated,
}

#[derive(Args, Debug, Clone)]
struct LeakOptions {
    /// Eviction region size, in 4 byte cells.
    #[arg(long, default_value_t = DEFAULT_FLUSH_SIZE)]
    flush_size: usize,

    /// Size of one probe half, in 4 byte cells.
    #[arg(long, default_value_t = DEFAULT_PROBE_SIZE)]
    probe_size: usize,

    /// Measurement pairs per bit.
    #[arg(short, long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,

    #[arg(long, default_value_t = DEFAULT_SECRET)]
    secret: u32,

    /// Times every bit is measured, ratios are averaged.
    #[arg(long, default_value_t = DEFAULT_BIT_REPEAT)]
    bit_repeat: usize,

    /// speculative, architectural or disabled.
    #[arg(long, default_value_t = GadgetMode::Speculative)]
    mode: GadgetMode,

    #[arg(long, value_enum, default_value_t = Backend::Native)]
    backend: Backend,

    /// Clock resolution of the native backend.
    #[arg(long, default_value_t = 100_000)]
    resolution_ns: u64,

    /// Maximum shift of the native clock edges.
    #[arg(long, default_value_t = 0)]
    jitter_ns: u64,

    /// Core to pin the measurement to.
    #[arg(long)]
    core: Option<usize>,

    /// Map the arena with huge pages when available.
    #[arg(long)]
    huge_pages: bool,
}

impl LeakOptions {
    fn params(&self, threshold: f64) -> LeakParameters {
        LeakParameters {
            flush_size: self.flush_size,
            probe_size: self.probe_size,
            iterations: self.iterations,
            secret: self.secret,
            bit_repeat: self.bit_repeat,
            threshold,
            mode: self.mode,
            huge_pages: self.huge_pages,
        }
    }
}

#[derive(Debug, Error)]
enum BenchmarkError {
    #[error(transparent)]
    Leak(#[from] LeakError),
    #[error("failed to save results: {0}")]
    Persist(#[from] PersistError),
    #[error("failed to create {path}: {source}")]
    SaveDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to pin to core {core}: {source}")]
    Affinity { core: usize, source: nix::Error },
}

fn print_values(report: &RunReport) {
    println!("original value: {:032b}", report.secret);
    println!("restored value: {:032b}", report.restored);
}

fn leak<P: SpeculativePrimitives>(orchestrator: &mut TrialOrchestrator<P>, runs: usize) {
    for _ in 0..runs {
        let report = orchestrator.run();
        if orchestrator.params().iterations > 1 {
            println!("{}", report);
        } else {
            print_values(&report);
        }
    }
}

fn calibrate<P: SpeculativePrimitives>(orchestrator: &mut TrialOrchestrator<P>, raw: bool) {
    let verbosity = if raw {
        Verbosity::RawResult
    } else {
        Verbosity::Thresholds
    };
    let calibration = calibrate_threshold(orchestrator, verbosity);
    if calibration.separates() {
        println!("suggested threshold: {:.4}", calibration.threshold);
    } else {
        println!(
            "no separating threshold (margin {:.4}), try more iterations",
            calibration.margin
        );
    }
}

fn save(dir: &Path, session: usize, result: &LeakBenchmarkResult) -> Result<(), BenchmarkError> {
    std::fs::create_dir_all(dir).map_err(|source| BenchmarkError::SaveDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(format!(
        "session_{}.{}",
        session,
        LeakBenchmarkResult::EXTENSION_ZSTD
    ));
    result.write_msgpack(&path)?;
    log::info!("saved {}", path.display());
    Ok(())
}

fn bench<P: SpeculativePrimitives>(
    orchestrator: &mut TrialOrchestrator<P>,
    runs: usize,
    sessions: usize,
    schedule: SecretSchedule,
    save_dir: Option<&Path>,
) -> Result<(), BenchmarkError> {
    let mut results = Vec::with_capacity(sessions);
    eprint!("Benchmarking {} sessions of {} runs", sessions, runs);
    for _ in 0..sessions {
        eprint!(".");
        results.push(benchmark_leak(orchestrator, runs, schedule));
    }
    eprintln!();

    println!("session,{}", LeakBenchmarkResult::csv_header());
    for (i, result) in results.iter().enumerate() {
        println!("{},{}", i, result.csv());
        if let Some(dir) = save_dir {
            save(dir, i, result)?;
        }
    }
    let stats = BenchmarkStats::from_results(&results);
    eprintln!(
        "Average p: {} C: {}, T: {}",
        stats.average_p, stats.average_c, stats.average_t
    );
    eprintln!(
        "Variance of p: {}, C: {}, T: {}",
        stats.var_p, stats.var_c, stats.var_t
    );
    Ok(())
}

fn execute<P: SpeculativePrimitives>(
    command: &Command,
    params: LeakParameters,
    primitives: P,
) -> Result<(), BenchmarkError> {
    let mut orchestrator = TrialOrchestrator::new(params, primitives)?;
    match command {
        Command::Leak { runs, .. } => {
            leak(&mut orchestrator, *runs);
            Ok(())
        }
        Command::Calibrate { raw, .. } => {
            calibrate(&mut orchestrator, *raw);
            Ok(())
        }
        Command::Bench {
            runs,
            sessions,
            random_secret,
            save,
            ..
        } => {
            let schedule = if *random_secret {
                SecretSchedule::Random
            } else {
                SecretSchedule::Fixed(orchestrator.params().secret)
            };
            bench(&mut orchestrator, *runs, *sessions, schedule, save.as_deref())
        }
    }
}

fn run(cli: &Cli) -> Result<(), BenchmarkError> {
    let (options, params) = match &cli.command {
        Command::Leak {
            options, threshold, ..
        } => (options, options.params(*threshold)),
        // Calibration ignores the decision threshold.
        Command::Calibrate { options, .. } => (options, options.params(1.0)),
        Command::Bench {
            options, threshold, ..
        } => (options, options.params(*threshold)),
    };
    let layout = params.validate()?;

    match options.backend {
        Backend::Simulated => execute(
            &cli.command,
            params,
            SimulatedCore::new(SimulationConfig::for_layout(&layout)),
        ),
        Backend::Native if options.jitter_ns > 0 => execute(
            &cli.command,
            params,
            NativePrimitives::new(JitteredClock::new(options.resolution_ns, options.jitter_ns)),
        ),
        Backend::Native => execute(
            &cli.command,
            params,
            NativePrimitives::new(CoarseClock::new(options.resolution_ns)),
        ),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn pinned_run(cli: &Cli, core: Option<usize>) -> Result<(), BenchmarkError> {
    use cache_side_channel::{core_set, restore_affinity, set_affinity};

    let Some(core) = core else {
        return run(cli);
    };
    let old = core_set(core)
        .and_then(|set| set_affinity(&set))
        .map_err(|source| BenchmarkError::Affinity { core, source })?;
    log::info!("pinned to core {}", core);
    let result = run(cli);
    restore_affinity(&old);
    result
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn pinned_run(cli: &Cli, core: Option<usize>) -> Result<(), BenchmarkError> {
    if core.is_some() {
        log::warn!("core pinning is not supported on this platform");
    }
    run(cli)
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let core = match &cli.command {
        Command::Leak { options, .. }
        | Command::Calibrate { options, .. }
        | Command::Bench { options, .. } => options.core,
    };
    match pinned_run(&cli, core) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
