//! Routing policies.
//!
//! Every policy implements the same interface: given a request and fresh
//! instance snapshots, produce a deterministic target. Composite policies
//! share the scorer set from [`crate::router::score`]; the SLO-adaptive
//! policy keeps one pre-built scorer pipeline per class plus a shared
//! prefix-affinity index.

use tracing::debug;

use crate::config::{ConfigError, RoutingConfig, RoutingPolicyKind, ScorerWeight};
use crate::core::request::{InstanceId, Request, SloClass};
use crate::router::affinity::PrefixAffinityIndex;
use crate::router::score::{build_scorer, ScoreContext, Scorer};
use crate::router::snapshot::RouterState;

/// Outcome of one routing decision.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target: InstanceId,
    /// Human-readable explanation, for logs and debugging.
    pub reason: String,
    /// Composite per-instance scores, when the policy computes them.
    pub scores: Option<Vec<f64>>,
    /// Optional priority hint handed to the instance scheduler.
    pub priority: Option<f64>,
}

/// A routing policy. `decide` takes `&mut self` because policies carry
/// state (round-robin counter, affinity index).
pub trait RoutingPolicy {
    fn decide(&mut self, req: &Request, hashes: &[u64], state: &RouterState) -> RoutingDecision;
}

/// Build the configured policy for a cluster of `instances`.
pub fn build_policy(
    config: &RoutingConfig,
    instances: usize,
) -> Result<Box<dyn RoutingPolicy>, ConfigError> {
    match config.policy {
        RoutingPolicyKind::RoundRobin => Ok(Box::new(RoundRobinPolicy { counter: 0 })),
        RoutingPolicyKind::LeastLoaded => Ok(Box::new(LeastLoadedPolicy)),
        RoutingPolicyKind::Weighted => {
            let scorers = build_scorers(&config.scorers)?;
            let wants_affinity = config.scorers.iter().any(|s| s.name == "prefix-affinity");
            Ok(Box::new(WeightedPolicy {
                scorers,
                affinity: PrefixAffinityIndex::new(instances, config.affinity_capacity),
                record_affinity: wants_affinity,
            }))
        }
        RoutingPolicyKind::AdaptiveWeighted => {
            Ok(Box::new(AdaptivePolicy::new(config, instances)?))
        }
    }
}

fn build_scorers(weights: &[ScorerWeight]) -> Result<Vec<(Box<dyn Scorer>, f64)>, ConfigError> {
    weights
        .iter()
        .map(|sw| {
            build_scorer(&sw.name)
                .map(|scorer| (scorer, sw.weight))
                .ok_or_else(|| ConfigError::UnknownScorer(sw.name.clone()))
        })
        .collect()
}

/// Weighted sum of scorer outputs, one value per snapshot.
fn composite_scores(
    scorers: &[(Box<dyn Scorer>, f64)],
    ctx: &ScoreContext<'_>,
) -> Vec<f64> {
    let mut totals = vec![0.0; ctx.state.snapshots.len()];
    for (scorer, weight) in scorers {
        for (total, score) in totals.iter_mut().zip(scorer.score(ctx)) {
            *total += weight * score;
        }
    }
    totals
}

/// Index of the maximum score; exact ties resolve to the earliest
/// snapshot.
fn argmax(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }
    best
}

/// Deterministic rotation over instances.
struct RoundRobinPolicy {
    counter: u64,
}

impl RoutingPolicy for RoundRobinPolicy {
    fn decide(&mut self, _req: &Request, _hashes: &[u64], state: &RouterState) -> RoutingDecision {
        let n = state.snapshots.len();
        let target = (self.counter % n as u64) as usize;
        self.counter += 1;
        RoutingDecision {
            target,
            reason: format!("round-robin slot {}", self.counter - 1),
            scores: None,
            priority: None,
        }
    }
}

/// Argmin of effective load.
struct LeastLoadedPolicy;

impl RoutingPolicy for LeastLoadedPolicy {
    fn decide(&mut self, _req: &Request, _hashes: &[u64], state: &RouterState) -> RoutingDecision {
        let target = state.least_loaded();
        RoutingDecision {
            target,
            reason: format!(
                "least-loaded (load {})",
                state.snapshots[target].effective_load()
            ),
            scores: None,
            priority: None,
        }
    }
}

/// Composite additive scoring with a fixed scorer set.
struct WeightedPolicy {
    scorers: Vec<(Box<dyn Scorer>, f64)>,
    affinity: PrefixAffinityIndex,
    record_affinity: bool,
}

impl RoutingPolicy for WeightedPolicy {
    fn decide(&mut self, req: &Request, hashes: &[u64], state: &RouterState) -> RoutingDecision {
        let ctx = ScoreContext {
            state,
            request: req,
            request_hashes: hashes,
            affinity: Some(&self.affinity),
        };
        let scores = composite_scores(&self.scorers, &ctx);
        let target = argmax(&scores);

        if self.record_affinity {
            self.affinity.record(target, hashes);
        }

        RoutingDecision {
            target,
            reason: format!("weighted (score {:.4})", scores[target]),
            scores: Some(scores),
            priority: None,
        }
    }
}

/// One scorer pipeline per SLO class.
struct Profile {
    scorers: Vec<(Box<dyn Scorer>, f64)>,
    max_load_headroom: Option<f64>,
}

fn builtin_profile(class: SloClass) -> (Vec<ScorerWeight>, Option<f64>) {
    match class {
        SloClass::Critical => (
            vec![
                ScorerWeight::new("queue-depth", 3.0),
                ScorerWeight::new("load-balance", 2.0),
                ScorerWeight::new("kv-utilization", 1.0),
                ScorerWeight::new("prefix-affinity", 1.0),
            ],
            Some(0.0),
        ),
        SloClass::Standard | SloClass::None => (
            vec![
                ScorerWeight::new("queue-depth", 2.0),
                ScorerWeight::new("prefix-affinity", 2.0),
                ScorerWeight::new("load-balance", 1.0),
                ScorerWeight::new("kv-utilization", 1.0),
            ],
            Some(4.0),
        ),
        SloClass::Sheddable | SloClass::Batch | SloClass::Background => (
            vec![
                ScorerWeight::new("prefix-affinity", 3.0),
                ScorerWeight::new("queue-depth", 1.0),
                ScorerWeight::new("kv-utilization", 1.0),
            ],
            None,
        ),
    }
}

fn priority_hint(class: SloClass) -> Option<f64> {
    match class {
        SloClass::Critical => Some(1000.0),
        SloClass::Standard => Some(100.0),
        _ => None,
    }
}

/// SLO-aware composite routing with per-class profiles, load-headroom
/// redirect, and penalties for tier pressure.
struct AdaptivePolicy {
    /// Profiles in `SloClass::ALL` order.
    profiles: Vec<Profile>,
    affinity: PrefixAffinityIndex,
    thrashing_threshold: f64,
}

impl AdaptivePolicy {
    fn new(config: &RoutingConfig, instances: usize) -> Result<Self, ConfigError> {
        let mut profiles = Vec::with_capacity(SloClass::ALL.len());
        for class in SloClass::ALL {
            let (default_weights, default_headroom) = builtin_profile(class);
            let override_config = config.profiles.get(&class.to_string());

            let weights = match override_config {
                Some(p) if !p.scorers.is_empty() => p.scorers.clone(),
                _ => default_weights,
            };
            let headroom = match override_config {
                Some(p) => p.max_load_headroom.or(default_headroom),
                None => default_headroom,
            };

            profiles.push(Profile {
                scorers: build_scorers(&weights)?,
                max_load_headroom: headroom,
            });
        }

        Ok(Self {
            profiles,
            affinity: PrefixAffinityIndex::new(instances, config.affinity_capacity),
            thrashing_threshold: config.thrashing_penalty_threshold,
        })
    }

    fn profile(&self, class: SloClass) -> &Profile {
        let index = SloClass::ALL
            .iter()
            .position(|&c| c == class)
            .unwrap_or(SloClass::ALL.len() - 1);
        &self.profiles[index]
    }
}

impl RoutingPolicy for AdaptivePolicy {
    fn decide(&mut self, req: &Request, hashes: &[u64], state: &RouterState) -> RoutingDecision {
        let profile = self.profile(req.slo_class);
        let ctx = ScoreContext {
            state,
            request: req,
            request_hashes: hashes,
            affinity: Some(&self.affinity),
        };
        let mut scores = composite_scores(&profile.scorers, &ctx);

        // Tier pressure penalties: an instance still draining transfers or
        // thrashing between tiers is a bad place to add work.
        for (score, snapshot) in scores.iter_mut().zip(&state.snapshots) {
            if snapshot.pending_transfer_latency > 0 {
                *score *= 0.5;
            }
            if snapshot.kv_thrashing_rate > self.thrashing_threshold {
                *score *= 0.5;
            }
        }

        let mut target = argmax(&scores);
        let mut reason = format!(
            "adaptive[{}] (score {:.4})",
            req.slo_class, scores[target]
        );

        if let Some(headroom) = profile.max_load_headroom {
            let least = state.least_loaded();
            let excess = state.snapshots[target].effective_load()
                - state.snapshots[least].effective_load();
            if excess > headroom {
                debug!(
                    class = %req.slo_class,
                    from = target,
                    to = least,
                    excess,
                    "load headroom exceeded, redirecting"
                );
                target = least;
                reason = format!(
                    "adaptive[{}] redirected to least-loaded (excess {excess})",
                    req.slo_class
                );
            }
        }

        self.affinity.record(target, hashes);

        RoutingDecision {
            target,
            reason,
            scores: Some(scores),
            priority: priority_hint(req.slo_class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::snapshot::InstanceSnapshot;

    fn snapshot(id: usize, queue: usize) -> InstanceSnapshot {
        InstanceSnapshot {
            id,
            queue_depth: queue,
            batch_size: 0,
            kv_utilization: 0.0,
            pending_requests: 0,
            pending_transfer_latency: 0,
            kv_thrashing_rate: 0.0,
        }
    }

    fn state(queues: &[usize]) -> RouterState {
        RouterState {
            snapshots: queues
                .iter()
                .enumerate()
                .map(|(id, &q)| snapshot(id, q))
                .collect(),
            clock: 0,
        }
    }

    fn request(class: SloClass) -> Request {
        let mut req = Request::new(1, (0..64).collect(), vec![0; 4]);
        req.slo_class = class;
        req
    }

    fn config(policy: RoutingPolicyKind) -> RoutingConfig {
        RoutingConfig {
            policy,
            ..RoutingConfig::default()
        }
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut policy = build_policy(&config(RoutingPolicyKind::RoundRobin), 2).unwrap();
        let state = state(&[0, 0]);
        let req = request(SloClass::None);
        assert_eq!(policy.decide(&req, &[], &state).target, 0);
        assert_eq!(policy.decide(&req, &[], &state).target, 1);
        assert_eq!(policy.decide(&req, &[], &state).target, 0);
    }

    #[test]
    fn test_least_loaded_tie_goes_first() {
        let mut policy = build_policy(&config(RoutingPolicyKind::LeastLoaded), 2).unwrap();
        let req = request(SloClass::None);
        assert_eq!(policy.decide(&req, &[], &state(&[3, 3])).target, 0);
        assert_eq!(policy.decide(&req, &[], &state(&[3, 1])).target, 1);
    }

    #[test]
    fn test_weighted_argmax_has_max_score() {
        let mut cfg = config(RoutingPolicyKind::Weighted);
        cfg.scorers = vec![
            ScorerWeight::new("queue-depth", 2.0),
            ScorerWeight::new("load-balance", 1.0),
        ];
        let mut policy = build_policy(&cfg, 3).unwrap();
        let req = request(SloClass::None);
        let decision = policy.decide(&req, &[], &state(&[5, 0, 9]));
        let scores = decision.scores.unwrap();
        assert_eq!(decision.target, 1);
        for score in &scores {
            assert!(scores[decision.target] >= *score);
        }
    }

    #[test]
    fn test_adaptive_affinity_wins_for_batch_class() {
        let mut policy = build_policy(&config(RoutingPolicyKind::AdaptiveWeighted), 2).unwrap();
        let hashes: Vec<u64> = (0..16).collect();

        // Seed affinity on instance 0 while loads are equal.
        let seed = request(SloClass::Batch);
        let first = policy.decide(&seed, &hashes, &state(&[0, 0]));
        assert_eq!(first.target, 0);

        // Load instance 0; a batch request still follows the cache.
        let decision = policy.decide(&request(SloClass::Batch), &hashes, &state(&[6, 0]));
        assert_eq!(decision.target, 0);

        // A critical request with the same prefix refuses the hot spot:
        // zero headroom redirects to the least-loaded instance.
        let decision = policy.decide(&request(SloClass::Critical), &hashes, &state(&[6, 0]));
        assert_eq!(decision.target, 1);
    }

    #[test]
    fn test_adaptive_penalizes_thrashing_instance() {
        let mut policy = build_policy(&config(RoutingPolicyKind::AdaptiveWeighted), 2).unwrap();
        let mut state = state(&[0, 0]);
        state.snapshots[0].kv_thrashing_rate = 0.9;
        let decision = policy.decide(&request(SloClass::Standard), &[], &state);
        assert_eq!(decision.target, 1);
    }
}
