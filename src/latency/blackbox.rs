//! Regression-based latency model.
//!
//! Fitted offline against a real serving engine: step time is linear in
//! cache-miss prefill tokens and decode tokens, queueing time is linear in
//! prompt length. Coefficients come straight from the config bundle.

use crate::config::BlackboxConfig;
use crate::core::request::{BatchFeatures, Tick};
use crate::latency::{LatencyError, LatencyModel};

/// Linear model over batch features.
#[derive(Debug, Clone)]
pub struct BlackboxModel {
    beta: Vec<f64>,
    alpha: Vec<f64>,
    scheduling_overhead: Tick,
    preemption_overhead: Tick,
}

impl BlackboxModel {
    pub fn new(config: &BlackboxConfig) -> Result<Self, LatencyError> {
        for (name, coefficients) in [("beta", &config.beta), ("alpha", &config.alpha)] {
            if coefficients.len() < 3 {
                return Err(LatencyError::ShortCoefficients {
                    name,
                    got: coefficients.len(),
                });
            }
            for (index, value) in coefficients.iter().enumerate() {
                if !value.is_finite() {
                    return Err(LatencyError::NonFiniteCoefficient { name, index });
                }
            }
        }

        Ok(Self {
            beta: config.beta.clone(),
            alpha: config.alpha.clone(),
            scheduling_overhead: config.scheduling_overhead,
            preemption_overhead: config.preemption_overhead,
        })
    }
}

impl LatencyModel for BlackboxModel {
    fn step_time(&self, features: &BatchFeatures) -> Tick {
        let estimate = self.beta[0]
            + self.beta[1] * features.cache_miss_tokens as f64
            + self.beta[2] * features.decode_tokens as f64;
        estimate.max(0.0).round() as Tick
    }

    fn queueing_time(&self, input_len: usize) -> Tick {
        let estimate = self.alpha[0] + self.alpha[1] * input_len as f64;
        estimate.max(0.0).round() as Tick
    }

    fn output_token_processing_time(&self) -> Tick {
        self.alpha[2].max(0.0).round() as Tick
    }

    fn scheduling_processing_time(&self) -> Tick {
        self.scheduling_overhead
    }

    fn preemption_processing_time(&self) -> Tick {
        self.preemption_overhead
    }
}
