use cache_utils::ticks::{measure_resolution, CoarseClock, JitteredClock};
use std::env::args;

// Usage: clock_info [resolution_ns [jitter_ns [samples]]]
//
// Prints how many busy-loop polls fit in one tick of the emulated coarse
// clock. A usable configuration needs a whole uncached chain walk to fit
// well inside one tick.

const DEFAULT_RESOLUTION_NS: u64 = 100_000;
const DEFAULT_SAMPLES: usize = 1000;

fn arg_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn main() {
    env_logger::init();
    let mut args = args().skip(1);
    let resolution_ns = arg_or(args.next(), DEFAULT_RESOLUTION_NS);
    let jitter_ns = arg_or(args.next(), 0u64);
    let samples = arg_or(args.next(), DEFAULT_SAMPLES);

    println!(
        "Measuring {} ticks, resolution {} ns, jitter {} ns",
        samples, resolution_ns, jitter_ns
    );
    let estimate = if jitter_ns == 0 {
        measure_resolution(&mut CoarseClock::new(resolution_ns), samples)
    } else {
        measure_resolution(&mut JitteredClock::new(resolution_ns, jitter_ns), samples)
    };
    println!("Mean tick: {:.1} ns", estimate.mean_tick_ns);
    println!(
        "Polls per tick: mean {:.1}, min {}",
        estimate.mean_count_per_tick, estimate.min_count_per_tick
    );
    if estimate.mean_count_per_tick > 0.0 {
        println!(
            "One poll: {:.2} ns",
            estimate.mean_tick_ns / estimate.mean_count_per_tick
        );
    }
}
