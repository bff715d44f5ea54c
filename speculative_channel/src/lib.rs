#![deny(unsafe_op_in_unsafe_fn)]

//! Leaks a 32 bit value one bit at a time through a mispredicted branch.
//!
//! For every bit, the gadget's branch is trained taken on harmless inputs,
//! then called with an uncached comparison value that fails it. While the
//! comparison resolves, the body runs speculatively and caches one of two
//! probe halves depending on the bit. Walking both halves against a coarse
//! clock afterwards tells which one is cached.

pub mod calibration;
mod error;
pub mod gadget;
pub mod orchestrator;
pub mod params;
pub mod sim;
pub mod trainer;

pub use error::LeakError;
pub use gadget::{GadgetMode, NativePrimitives, SpeculativePrimitives};
pub use orchestrator::{RunReport, TrialOrchestrator};
pub use params::LeakParameters;

/// Builds an orchestrator and leaks `params.secret` once.
pub fn leak_value<P: SpeculativePrimitives>(
    params: LeakParameters,
    primitives: P,
) -> Result<RunReport, LeakError> {
    let mut orchestrator = TrialOrchestrator::new(params, primitives)?;
    Ok(orchestrator.run())
}
