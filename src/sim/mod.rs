//! Simulation drivers:
//! - [`kernel`]: the event loop
//! - [`instance`]: per-instance state, the `Step` machine, single-instance driver
//! - [`cluster`]: N instances behind admission and routing

pub mod cluster;
pub mod instance;
pub mod kernel;

use thiserror::Error;

use crate::config::ConfigError;
use crate::kv::store::KvError;
use crate::latency::LatencyError;

/// Construction-time failures for a simulator. Runtime anomalies never
/// surface here; they are logged and reflected in metrics.
#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Latency(#[from] LatencyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
