//! Wait queue for requests pending scheduling.
//!
//! Plain FIFO over request handles. Preemption restores FCFS order by
//! prepending the evicted request at the front.

use std::collections::VecDeque;

use crate::core::request::RequestId;

/// Ordered queue of requests in the `Queued` state.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<RequestId>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail (normal arrival path).
    pub fn enqueue(&mut self, id: RequestId) {
        self.entries.push_back(id);
    }

    /// Push to the front. Used when a preempted request re-enters the
    /// queue so it is retried before anything that arrived after it.
    pub fn prepend(&mut self, id: RequestId) {
        self.entries.push_front(id);
    }

    pub fn dequeue(&mut self) -> Option<RequestId> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<RequestId> {
        self.entries.front().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the queue contents with a reordered sequence. The scheduler
    /// uses this after a stable sort; the new order must be a permutation
    /// of the old.
    pub fn reorder(&mut self, order: Vec<RequestId>) {
        debug_assert_eq!(order.len(), self.entries.len());
        self.entries = order.into();
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().copied()
    }
}
