//! Wait-queue reordering disciplines.
//!
//! The scheduler reorders the wait queue before batch formation scans it.
//! All sorts are stable with fully deterministic tie-breaks, so two runs
//! over the same queue always produce the same order.

use crate::config::SchedulerKind;
use crate::core::queue::WaitQueue;
use crate::core::request::RequestTable;

/// Queue reorderer for one instance.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    kind: SchedulerKind,
}

impl Scheduler {
    pub fn new(kind: SchedulerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    /// Reorder the queue in place. `fcfs` is the identity.
    pub fn reorder(&self, queue: &mut WaitQueue, table: &RequestTable) {
        if self.kind == SchedulerKind::Fcfs || queue.len() < 2 {
            return;
        }

        let mut order: Vec<_> = queue.iter().collect();
        match self.kind {
            SchedulerKind::Fcfs => {}
            SchedulerKind::PriorityFcfs => {
                order.sort_by(|&a, &b| {
                    let ra = table.get(a);
                    let rb = table.get(b);
                    rb.priority
                        .total_cmp(&ra.priority)
                        .then_with(|| ra.arrival_time.cmp(&rb.arrival_time))
                        .then_with(|| ra.id.cmp(&rb.id))
                });
            }
            SchedulerKind::Sjf => {
                order.sort_by(|&a, &b| {
                    let ra = table.get(a);
                    let rb = table.get(b);
                    ra.input_len()
                        .cmp(&rb.input_len())
                        .then_with(|| ra.arrival_time.cmp(&rb.arrival_time))
                        .then_with(|| ra.id.cmp(&rb.id))
                });
            }
        }
        queue.reorder(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::Request;

    fn table_with(reqs: Vec<Request>) -> RequestTable {
        let mut table = RequestTable::new();
        for req in reqs {
            table.insert(req);
        }
        table
    }

    fn req(id: u64, input_len: usize, arrival: u64, priority: f64) -> Request {
        let mut r = Request::new(id, vec![0; input_len], vec![0; 2]);
        r.arrival_time = arrival;
        r.priority = priority;
        r
    }

    #[test]
    fn test_fcfs_is_identity() {
        let table = table_with(vec![req(1, 10, 0, 0.0), req(2, 5, 1, 9.0)]);
        let mut queue = WaitQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        Scheduler::new(SchedulerKind::Fcfs).reorder(&mut queue, &table);
        assert_eq!(queue.dequeue(), Some(1));
    }

    #[test]
    fn test_priority_fcfs_sorts_descending_priority() {
        let table = table_with(vec![
            req(1, 10, 0, 1.0),
            req(2, 10, 1, 5.0),
            req(3, 10, 2, 5.0),
        ]);
        let mut queue = WaitQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        Scheduler::new(SchedulerKind::PriorityFcfs).reorder(&mut queue, &table);
        // 2 and 3 tie on priority; earlier arrival wins.
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), Some(1));
    }

    #[test]
    fn test_sjf_sorts_by_input_length() {
        let table = table_with(vec![
            req(1, 100, 0, 0.0),
            req(2, 10, 1, 0.0),
            req(3, 50, 2, 0.0),
        ]);
        let mut queue = WaitQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        Scheduler::new(SchedulerKind::Sjf).reorder(&mut queue, &table);
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), Some(1));
    }
}
