//! Workload sources.
//!
//! A workload is an ordered list of requests with absolute arrival ticks.
//! It comes from a CSV trace ([`trace`]) or the distribution-based
//! generator ([`synth`]); both produce the same `Vec<Request>` shape the
//! simulators consume.

pub mod synth;
pub mod trace;

use std::path::PathBuf;

use thiserror::Error;

/// Token IDs are drawn from `[0, VOCAB)`.
pub const VOCAB: u32 = 32_000;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("failed to read workload {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse workload {path} row {row}: {message}")]
    Csv {
        path: PathBuf,
        row: usize,
        message: String,
    },

    #[error("workload {path} contains duplicate request id {id}")]
    DuplicateId { path: PathBuf, id: u64 },

    #[error("bad distribution parameters: {0}")]
    BadDistribution(String),
}
