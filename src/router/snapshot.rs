//! Read-only instance state sampled for routing decisions.

use crate::core::request::{InstanceId, Tick};

/// One instance's load signals, sampled just before a routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub queue_depth: usize,
    pub batch_size: usize,
    /// Fast-tier KV utilization in [0, 1].
    pub kv_utilization: f64,
    /// Requests routed here but not yet enqueued.
    pub pending_requests: usize,
    pub pending_transfer_latency: Tick,
    pub kv_thrashing_rate: f64,
}

impl InstanceSnapshot {
    /// The router's load signal: queued + running + in-flight routed.
    pub fn effective_load(&self) -> f64 {
        (self.queue_depth + self.batch_size + self.pending_requests) as f64
    }
}

/// Snapshots of every instance (in instance-index order) plus the clock.
#[derive(Debug, Clone)]
pub struct RouterState {
    pub snapshots: Vec<InstanceSnapshot>,
    pub clock: Tick,
}

impl RouterState {
    /// Index of the least-loaded instance, ties broken by snapshot order.
    pub fn least_loaded(&self) -> usize {
        let mut best = 0;
        for (i, snapshot) in self.snapshots.iter().enumerate().skip(1) {
            if snapshot.effective_load() < self.snapshots[best].effective_load() {
                best = i;
            }
        }
        best
    }

    pub fn mean_effective_load(&self) -> f64 {
        if self.snapshots.is_empty() {
            return 0.0;
        }
        self.snapshots
            .iter()
            .map(InstanceSnapshot::effective_load)
            .sum::<f64>()
            / self.snapshots.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn snapshot(id: InstanceId, queue: usize, batch: usize, pending: usize) -> InstanceSnapshot {
        InstanceSnapshot {
            id,
            queue_depth: queue,
            batch_size: batch,
            kv_utilization: 0.0,
            pending_requests: pending,
            pending_transfer_latency: 0,
            kv_thrashing_rate: 0.0,
        }
    }

    #[test]
    fn test_effective_load() {
        assert_eq!(snapshot(0, 3, 2, 1).effective_load(), 6.0);
    }

    #[test]
    fn test_least_loaded_tie_breaks_to_first() {
        let state = RouterState {
            snapshots: vec![snapshot(0, 1, 1, 0), snapshot(1, 1, 1, 0), snapshot(2, 0, 1, 0)],
            clock: 0,
        };
        assert_eq!(state.least_loaded(), 2);

        let tied = RouterState {
            snapshots: vec![snapshot(0, 1, 0, 0), snapshot(1, 1, 0, 0)],
            clock: 0,
        };
        assert_eq!(tied.least_loaded(), 0);
    }
}
