//! Per-request priority computation.
//!
//! Priorities are recomputed for every queued request at each step and
//! consumed by the `priority-fcfs` reorderer. Computation is pure: it
//! never mutates the request.

use crate::config::{PriorityConfig, PriorityPolicyKind};
use crate::core::request::{Request, SloClass, Tick};

/// Built-in base priority per SLO class.
fn default_class_base(class: SloClass) -> f64 {
    match class {
        SloClass::Critical => 1000.0,
        SloClass::Standard => 100.0,
        SloClass::None => 50.0,
        SloClass::Sheddable => 10.0,
        SloClass::Batch => 1.0,
        SloClass::Background => 0.0,
    }
}

/// Priority policy configured for an instance.
#[derive(Debug, Clone)]
pub struct PriorityPolicy {
    kind: PriorityPolicyKind,
    age_weight: f64,
    config: PriorityConfig,
}

impl PriorityPolicy {
    pub fn new(config: &PriorityConfig) -> Self {
        Self {
            kind: config.policy,
            age_weight: config.age_weight,
            config: config.clone(),
        }
    }

    fn class_base(&self, class: SloClass) -> f64 {
        self.config
            .class_base
            .get(&class.to_string())
            .copied()
            .unwrap_or_else(|| default_class_base(class))
    }

    /// Compute the priority of `req` at simulated time `now`. Higher means
    /// more urgent.
    pub fn compute(&self, req: &Request, now: Tick) -> f64 {
        let age = now.saturating_sub(req.arrival_time) as f64;
        match self.kind {
            PriorityPolicyKind::Constant => 0.0,
            PriorityPolicyKind::SloBased => self.class_base(req.slo_class) + self.age_weight * age,
            // Stress-test variant: aging pushes requests down instead of up.
            PriorityPolicyKind::InvertedSlo => {
                self.class_base(req.slo_class) - self.age_weight * age
            }
        }
    }
}
