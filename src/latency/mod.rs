//! Step-duration estimation.
//!
//! Two models sit behind one trait: a regression fit over batch features
//! ([`blackbox`]) and an analytical roofline derived from model FLOP and
//! memory-traffic formulas scaled by measured MFU ([`roofline`], fed by
//! [`mfu`]). Both are pure functions of their inputs given fixed
//! coefficients, which the determinism contract depends on.

pub mod blackbox;
pub mod mfu;
pub mod roofline;

use thiserror::Error;

use crate::config::LatencyConfig;
use crate::core::request::{BatchFeatures, Tick};

#[derive(Error, Debug)]
pub enum LatencyError {
    #[error("blackbox coefficient {name}[{index}] is not finite")]
    NonFiniteCoefficient { name: &'static str, index: usize },

    #[error("blackbox needs at least 3 {name} coefficients, got {got}")]
    ShortCoefficients { name: &'static str, got: usize },

    #[error("unknown model {0:?} (no built-in spec)")]
    UnknownModel(String),

    #[error("unknown gpu {0:?} (no built-in spec)")]
    UnknownGpu(String),

    #[error("tensor-parallel degree must be nonzero")]
    ZeroTensorParallel,

    #[error("bw_efficiency {0} outside (0, 1]")]
    BadBwEfficiency(f64),

    #[error(transparent)]
    Mfu(#[from] mfu::MfuError),

    #[error("latency config selects no model variant")]
    NoVariant,
}

/// Estimates the durations the step loop charges against the clock.
pub trait LatencyModel {
    /// Duration of one engine step over the formed batch, in ticks.
    fn step_time(&self, features: &BatchFeatures) -> Tick;

    /// Fixed queue-handling delay for a request of the given prompt length.
    fn queueing_time(&self, input_len: usize) -> Tick;

    /// Per-output-token post-processing time (detokenize, stream).
    fn output_token_processing_time(&self) -> Tick;

    /// Overhead between batch formation and a request starting to run.
    fn scheduling_processing_time(&self) -> Tick;

    /// Overhead of evicting a request back to the wait queue.
    fn preemption_processing_time(&self) -> Tick;
}

/// Construct the configured model variant.
pub fn build(config: &LatencyConfig) -> Result<Box<dyn LatencyModel>, LatencyError> {
    let effective = config.effective();
    if let Some(blackbox) = &effective.blackbox {
        return Ok(Box::new(blackbox::BlackboxModel::new(blackbox)?));
    }
    if let Some(roofline) = &effective.roofline {
        return Ok(Box::new(roofline::RooflineModel::from_config(roofline)?));
    }
    Err(LatencyError::NoVariant)
}
