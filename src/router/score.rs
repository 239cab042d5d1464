//! Routing scorers.
//!
//! A scorer maps the router state to one normalized value in [0, 1] per
//! instance; higher means "prefer this instance". Composite policies take
//! weighted sums of scorer outputs. Every scorer must return finite values
//! for every snapshot; that invariant is tested, not assumed.

use crate::core::request::{Request, SloClass};
use crate::router::affinity::PrefixAffinityIndex;
use crate::router::snapshot::RouterState;

/// Inputs available to a scorer for one decision.
pub struct ScoreContext<'a> {
    pub state: &'a RouterState,
    pub request: &'a Request,
    /// Block hashes of the request's prompt (router block size).
    pub request_hashes: &'a [u64],
    /// Router-side prefix index, when the policy keeps one.
    pub affinity: Option<&'a PrefixAffinityIndex>,
}

/// One named scoring dimension.
pub trait Scorer {
    fn name(&self) -> &'static str;

    /// One score per snapshot, aligned with `ctx.state.snapshots`.
    fn score(&self, ctx: &ScoreContext<'_>) -> Vec<f64>;
}

/// Construct a scorer by its config name. Names were validated at config
/// load; unknown names here are a programming error.
pub fn build_scorer(name: &str) -> Option<Box<dyn Scorer>> {
    match name {
        "queue-depth" => Some(Box::new(QueueDepthScorer)),
        "kv-utilization" => Some(Box::new(KvUtilizationScorer)),
        "load-balance" => Some(Box::new(LoadBalanceScorer)),
        "prefix-affinity" => Some(Box::new(PrefixAffinityScorer)),
        "slo-priority" => Some(Box::new(SloPriorityScorer)),
        _ => None,
    }
}

/// Min-max normalized queue depth, inverted so shallow queues score high.
/// All-equal depths (including a single instance) score 1.0.
pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn name(&self) -> &'static str {
        "queue-depth"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Vec<f64> {
        let depths: Vec<f64> = ctx
            .state
            .snapshots
            .iter()
            .map(|s| s.queue_depth as f64)
            .collect();
        let min = depths.iter().copied().fold(f64::INFINITY, f64::min);
        let max = depths.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max <= min {
            return vec![1.0; depths.len()];
        }
        depths.iter().map(|d| (max - d) / (max - min)).collect()
    }
}

/// Free KV headroom: 1 - fast-tier utilization.
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn name(&self) -> &'static str {
        "kv-utilization"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Vec<f64> {
        ctx.state
            .snapshots
            .iter()
            .map(|s| (1.0 - s.kv_utilization).clamp(0.0, 1.0))
            .collect()
    }
}

/// Reciprocal effective load: 1 / (1 + load).
pub struct LoadBalanceScorer;

impl Scorer for LoadBalanceScorer {
    fn name(&self) -> &'static str {
        "load-balance"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Vec<f64> {
        ctx.state
            .snapshots
            .iter()
            .map(|s| 1.0 / (1.0 + s.effective_load()))
            .collect()
    }
}

/// Fraction of the request's blocks the router believes each instance has
/// cached. Requests shorter than one block score 0 everywhere.
pub struct PrefixAffinityScorer;

impl Scorer for PrefixAffinityScorer {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Vec<f64> {
        let total = ctx.request_hashes.len();
        ctx.state
            .snapshots
            .iter()
            .map(|s| match (ctx.affinity, total) {
                (Some(index), 1..) => {
                    index.match_length(s.id, ctx.request_hashes) as f64 / total as f64
                }
                _ => 0.0,
            })
            .collect()
    }
}

/// Class-controlled blend of load headroom and KV headroom. Critical
/// requests weigh load heavily; batch-tier requests mostly care about
/// cache headroom.
pub struct SloPriorityScorer;

impl SloPriorityScorer {
    fn blend(class: SloClass) -> f64 {
        match class {
            SloClass::Critical => 0.9,
            SloClass::Standard => 0.7,
            SloClass::Sheddable => 0.5,
            SloClass::Batch => 0.3,
            SloClass::Background => 0.2,
            SloClass::None => 0.5,
        }
    }
}

impl Scorer for SloPriorityScorer {
    fn name(&self) -> &'static str {
        "slo-priority"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Vec<f64> {
        let lambda = Self::blend(ctx.request.slo_class);
        ctx.state
            .snapshots
            .iter()
            .map(|s| {
                let load_score = 1.0 / (1.0 + s.effective_load());
                let kv_score = (1.0 - s.kv_utilization).clamp(0.0, 1.0);
                lambda * load_score + (1.0 - lambda) * kv_score
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SCORER_NAMES;
    use crate::core::request::Request;
    use crate::router::snapshot::InstanceSnapshot;

    fn state(queue_depths: &[usize]) -> RouterState {
        RouterState {
            snapshots: queue_depths
                .iter()
                .enumerate()
                .map(|(id, &queue_depth)| InstanceSnapshot {
                    id,
                    queue_depth,
                    batch_size: 1,
                    kv_utilization: 0.25,
                    pending_requests: 0,
                    pending_transfer_latency: 0,
                    kv_thrashing_rate: 0.0,
                })
                .collect(),
            clock: 0,
        }
    }

    fn context<'a>(state: &'a RouterState, request: &'a Request) -> ScoreContext<'a> {
        ScoreContext {
            state,
            request,
            request_hashes: &[],
            affinity: None,
        }
    }

    #[test]
    fn test_all_scorers_in_unit_range() {
        let state = state(&[0, 3, 100]);
        let request = Request::new(1, vec![0; 64], vec![0; 4]);
        let ctx = context(&state, &request);

        for name in SCORER_NAMES {
            let scorer = build_scorer(name).unwrap();
            let scores = scorer.score(&ctx);
            assert_eq!(scores.len(), 3, "{name}");
            for score in scores {
                assert!((0.0..=1.0).contains(&score), "{name}: {score}");
                assert!(score.is_finite(), "{name}");
            }
        }
    }

    #[test]
    fn test_queue_depth_all_equal_scores_one() {
        let state = state(&[4, 4]);
        let request = Request::new(1, vec![0; 8], vec![]);
        let scores = QueueDepthScorer.score(&context(&state, &request));
        assert_eq!(scores, vec![1.0, 1.0]);
    }

    #[test]
    fn test_queue_depth_monotone() {
        let state = state(&[0, 5, 10]);
        let request = Request::new(1, vec![0; 8], vec![]);
        let scores = QueueDepthScorer.score(&context(&state, &request));
        assert!(scores[0] > scores[1]);
        assert!(scores[1] > scores[2]);
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_prefix_affinity_uses_index() {
        let state = state(&[0, 0]);
        let request = Request::new(1, vec![0; 64], vec![]);
        let mut index = PrefixAffinityIndex::new(2, 64);
        index.record(1, &[10, 20]);

        let hashes = [10u64, 20, 30, 40];
        let ctx = ScoreContext {
            state: &state,
            request: &request,
            request_hashes: &hashes,
            affinity: Some(&index),
        };
        let scores = PrefixAffinityScorer.score(&ctx);
        assert_eq!(scores[0], 0.0);
        assert_eq!(scores[1], 0.5);
    }

    #[test]
    fn test_slo_priority_class_sensitivity() {
        // Instance 0 idle, instance 1 loaded. Critical leans harder toward
        // the idle instance than batch does.
        let state = state(&[0, 20]);
        let mut critical = Request::new(1, vec![0; 8], vec![]);
        critical.slo_class = SloClass::Critical;
        let mut batch = Request::new(2, vec![0; 8], vec![]);
        batch.slo_class = SloClass::Batch;

        let crit_scores = SloPriorityScorer.score(&context(&state, &critical));
        let batch_scores = SloPriorityScorer.score(&context(&state, &batch));
        assert!(
            crit_scores[0] - crit_scores[1] > batch_scores[0] - batch_scores[1]
        );
    }
}
