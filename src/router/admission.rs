//! Admission control at the cluster edge.
//!
//! Policies decide, before routing, whether a request enters the system
//! at all. Rejections are terminal: the request is counted but never
//! reaches an instance.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{AdmissionConfig, AdmissionPolicyKind};
use crate::core::request::{Request, SloClass, Tick};
use crate::router::snapshot::RouterState;

/// Admission outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admit,
    Reject { reason: String },
}

pub trait AdmissionPolicy {
    fn admit(&mut self, req: &Request, state: &RouterState) -> AdmissionVerdict;
}

/// Build the configured admission policy.
pub fn build_admission(config: &AdmissionConfig) -> Box<dyn AdmissionPolicy> {
    match config.policy {
        AdmissionPolicyKind::AlwaysAdmit => Box::new(AlwaysAdmit),
        AdmissionPolicyKind::RejectAll => Box::new(RejectAll),
        AdmissionPolicyKind::TokenBucket => Box::new(TokenBucket {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            per_tenant: config.per_tenant,
            buckets: HashMap::new(),
        }),
        AdmissionPolicyKind::SloGated => Box::new(SloGated {
            load_threshold: config.load_threshold,
        }),
    }
}

struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&mut self, _req: &Request, _state: &RouterState) -> AdmissionVerdict {
        AdmissionVerdict::Admit
    }
}

/// Pathological policy for tests: nothing gets in.
struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn admit(&mut self, _req: &Request, _state: &RouterState) -> AdmissionVerdict {
        AdmissionVerdict::Reject {
            reason: "reject-all".to_string(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Tick,
}

/// Token bucket keyed by tenant (or one global bucket). Cost is the
/// request's prompt length; refill is clock-driven.
struct TokenBucket {
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    per_tenant: bool,
    buckets: HashMap<String, Bucket>,
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&mut self, req: &Request, state: &RouterState) -> AdmissionVerdict {
        let key = if self.per_tenant {
            req.tenant_id.clone()
        } else {
            String::new()
        };
        let bucket = self.buckets.entry(key).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: 0,
        });

        let elapsed = state.clock.saturating_sub(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed as f64 * self.refill_rate / 1e6).min(self.capacity);
        bucket.last_refill = state.clock;

        let cost = req.input_len() as f64;
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            AdmissionVerdict::Admit
        } else {
            debug!(
                request_id = req.id,
                tenant = %req.tenant_id,
                cost,
                available = bucket.tokens,
                "token bucket rejection"
            );
            AdmissionVerdict::Reject {
                reason: format!("token bucket exhausted (cost {cost})"),
            }
        }
    }
}

/// Sheds sheddable-class requests once the cluster runs hot. Critical and
/// standard traffic always passes.
struct SloGated {
    load_threshold: f64,
}

impl AdmissionPolicy for SloGated {
    fn admit(&mut self, req: &Request, state: &RouterState) -> AdmissionVerdict {
        if req.slo_class == SloClass::Sheddable
            && state.mean_effective_load() > self.load_threshold
        {
            return AdmissionVerdict::Reject {
                reason: format!(
                    "slo-gated: mean load {:.2} above {:.2}",
                    state.mean_effective_load(),
                    self.load_threshold
                ),
            };
        }
        AdmissionVerdict::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::snapshot::InstanceSnapshot;

    fn state(clock: Tick, queue: usize) -> RouterState {
        RouterState {
            snapshots: vec![InstanceSnapshot {
                id: 0,
                queue_depth: queue,
                batch_size: 0,
                kv_utilization: 0.0,
                pending_requests: 0,
                pending_transfer_latency: 0,
                kv_thrashing_rate: 0.0,
            }],
            clock,
        }
    }

    fn request(input: usize, class: SloClass, tenant: &str) -> Request {
        let mut req = Request::new(1, vec![0; input], vec![0]);
        req.slo_class = class;
        req.tenant_id = tenant.to_string();
        req
    }

    fn admission(policy: AdmissionPolicyKind, capacity: f64, refill: f64) -> Box<dyn AdmissionPolicy> {
        build_admission(&AdmissionConfig {
            policy,
            capacity,
            refill_rate: refill,
            ..AdmissionConfig::default()
        })
    }

    #[test]
    fn test_always_admit_and_reject_all() {
        let req = request(10, SloClass::None, "");
        let st = state(0, 0);
        assert_eq!(
            admission(AdmissionPolicyKind::AlwaysAdmit, 0.0, 0.0).admit(&req, &st),
            AdmissionVerdict::Admit
        );
        assert!(matches!(
            admission(AdmissionPolicyKind::RejectAll, 0.0, 0.0).admit(&req, &st),
            AdmissionVerdict::Reject { .. }
        ));
    }

    #[test]
    fn test_token_bucket_drains_and_refills() {
        let mut policy = admission(AdmissionPolicyKind::TokenBucket, 100.0, 50.0);
        let req = request(60, SloClass::None, "");

        assert_eq!(policy.admit(&req, &state(0, 0)), AdmissionVerdict::Admit);
        // 40 tokens left: a second 60-token prompt bounces.
        assert!(matches!(
            policy.admit(&req, &state(0, 0)),
            AdmissionVerdict::Reject { .. }
        ));
        // One simulated second at 50 tok/s refills past 60.
        assert_eq!(
            policy.admit(&req, &state(1_000_000, 0)),
            AdmissionVerdict::Admit
        );
    }

    #[test]
    fn test_token_bucket_per_tenant_isolation() {
        let mut policy = build_admission(&AdmissionConfig {
            policy: AdmissionPolicyKind::TokenBucket,
            capacity: 100.0,
            refill_rate: 0.0,
            per_tenant: true,
            ..AdmissionConfig::default()
        });
        let alice = request(80, SloClass::None, "alice");
        let bob = request(80, SloClass::None, "bob");

        assert_eq!(policy.admit(&alice, &state(0, 0)), AdmissionVerdict::Admit);
        assert!(matches!(
            policy.admit(&alice, &state(0, 0)),
            AdmissionVerdict::Reject { .. }
        ));
        // Bob has his own bucket.
        assert_eq!(policy.admit(&bob, &state(0, 0)), AdmissionVerdict::Admit);
    }

    #[test]
    fn test_slo_gated_sheds_only_sheddable() {
        let mut policy = build_admission(&AdmissionConfig {
            policy: AdmissionPolicyKind::SloGated,
            load_threshold: 4.0,
            ..AdmissionConfig::default()
        });
        let hot = state(0, 10);

        assert!(matches!(
            policy.admit(&request(10, SloClass::Sheddable, ""), &hot),
            AdmissionVerdict::Reject { .. }
        ));
        assert_eq!(
            policy.admit(&request(10, SloClass::Critical, ""), &hot),
            AdmissionVerdict::Admit
        );
        assert_eq!(
            policy.admit(&request(10, SloClass::Standard, ""), &hot),
            AdmissionVerdict::Admit
        );

        // Below threshold sheddable passes too.
        assert_eq!(
            policy.admit(&request(10, SloClass::Sheddable, ""), &state(0, 2)),
            AdmissionVerdict::Admit
        );
    }
}
