//! Per-instance serving simulation.
//!
//! [`InstanceSim`] owns one instance's wait queue, KV store, running
//! batch, and metrics, and implements the two-phase `Step`: form the next
//! batch (budgets, chunked prefill, preemption), then execute it against
//! the latency model (progress updates, TTFT/ITL bookkeeping,
//! completions). [`InstanceSimulator`] is the single-instance driver that
//! feeds a workload through the kernel.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::SimConfig;
use crate::core::event::Event;
use crate::core::queue::WaitQueue;
use crate::core::request::{
    Batch, BatchFeatures, InstanceId, Request, RequestId, RequestState, RequestTable, Tick,
};
use crate::kv::hash::block_hashes;
use crate::kv::store::KvStore;
use crate::latency::LatencyModel;
use crate::metrics::{InstanceMetrics, InstanceReport, SimReport};
use crate::sched::batch::{form_batch, PrefixHashes};
use crate::sched::priority::PriorityPolicy;
use crate::sched::scheduler::Scheduler;
use crate::sim::kernel::Kernel;
use crate::sim::SimError;
use crate::router::snapshot::InstanceSnapshot;

/// State and step logic for one serving instance.
pub struct InstanceSim {
    id: InstanceId,
    config: SimConfig,
    wait_queue: WaitQueue,
    kv: KvStore,
    running_batch: Batch,
    /// Request ID -> total tokens computed, including cache-served ones.
    computed_tokens: HashMap<RequestId, usize>,
    prefix_hashes: PrefixHashes,
    scheduler: Scheduler,
    priority_policy: PriorityPolicy,
    pub metrics: InstanceMetrics,
    /// A `Step` event is in flight.
    step_pending: bool,
    /// Requests routed here but not yet arrived (router signal).
    pending_routed: usize,
}

impl InstanceSim {
    pub fn new(id: InstanceId, config: &SimConfig) -> Result<Self, SimError> {
        Ok(Self {
            id,
            config: config.clone(),
            wait_queue: WaitQueue::new(),
            kv: KvStore::new(&config.kv_cache)?,
            running_batch: Vec::new(),
            computed_tokens: HashMap::new(),
            prefix_hashes: PrefixHashes::new(),
            scheduler: Scheduler::new(config.scheduler),
            priority_policy: PriorityPolicy::new(&config.priority),
            metrics: InstanceMetrics::new(),
            step_pending: false,
            pending_routed: 0,
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// The router decided to send a request here; it has not arrived yet.
    pub fn note_routed(&mut self) {
        self.pending_routed += 1;
    }

    /// Sample this instance's load signals for the router.
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            queue_depth: self.wait_queue.len(),
            batch_size: self.running_batch.len(),
            kv_utilization: self.kv.utilization(),
            pending_requests: self.pending_routed,
            pending_transfer_latency: self.kv.pending_transfer_latency(),
            kv_thrashing_rate: self.kv.thrashing_rate(),
        }
    }

    /// A request reaches this instance's wait queue.
    pub fn on_arrival(
        &mut self,
        id: RequestId,
        table: &mut RequestTable,
        now: Tick,
    ) -> Vec<(Tick, Event)> {
        let req = table.get_mut(id);
        req.state = RequestState::Queued;
        self.metrics.on_arrival(req.input_len());
        self.prefix_hashes
            .insert(id, block_hashes(&req.input_tokens, self.kv.block_size()));
        self.wait_queue.enqueue(id);
        self.pending_routed = self.pending_routed.saturating_sub(1);
        trace!(instance = self.id, request_id = id, tick = now, "request arrived");

        if self.step_pending {
            Vec::new()
        } else {
            self.step_pending = true;
            vec![(now, Event::Step(self.id))]
        }
    }

    /// Record the scheduling-delay metric when a `Scheduled` event fires.
    pub fn on_scheduled_event(&mut self, id: RequestId, table: &mut RequestTable, now: Tick) {
        let req = table.get_mut(id);
        if req.scheduling_delay.is_none() {
            let delay = now.saturating_sub(req.arrival_time);
            req.scheduling_delay = Some(delay);
            self.metrics.on_scheduled(delay);
        }
    }

    pub fn on_preemption_event(&mut self) {
        self.metrics.on_preemption();
    }

    /// One engine step: form the batch, execute it, schedule follow-ups.
    pub fn on_step(
        &mut self,
        table: &mut RequestTable,
        latency: &dyn LatencyModel,
        now: Tick,
    ) -> Vec<(Tick, Event)> {
        self.kv.set_clock(now);

        // Recompute priorities for everything queued, then reorder.
        let priorities: Vec<(RequestId, f64)> = self
            .wait_queue
            .iter()
            .map(|id| (id, self.priority_policy.compute(table.get(id), now)))
            .collect();
        for (id, priority) in priorities {
            table.get_mut(id).priority = priority;
        }
        self.scheduler.reorder(&mut self.wait_queue, table);

        // Phase 1: form the batch.
        let result = form_batch(
            &self.config.batch,
            &self.running_batch,
            &mut self.wait_queue,
            &mut self.kv,
            table,
            &mut self.computed_tokens,
            &self.prefix_hashes,
            latency,
            now,
        );
        self.running_batch = result.batch;
        for _ in &result.dropped {
            self.metrics.on_drop();
        }

        // Phase 2: execute it.
        let features = BatchFeatures::from_batch(&self.running_batch, table);
        let step_duration = latency.step_time(&features);
        let token_time = latency.output_token_processing_time();

        for &id in &self.running_batch {
            let req = table.get_mut(id);
            if req.in_prefill() {
                req.progress_index = self.computed_tokens[&id];
            } else if req.num_new_tokens > 0 {
                req.progress_index += 1;
                req.itl.push(step_duration + token_time);
                self.metrics.on_output_token();
            }

            // Prefill boundary: the first output token exists at the end
            // of this step. Recorded at most once per request.
            if req.progress_index == req.input_len() && req.first_token_time.is_none() {
                req.first_token_time =
                    Some(now + step_duration + token_time - req.arrival_time);
                if req.output_len() > 0 {
                    self.metrics.on_output_token();
                }
            }
        }

        self.metrics.on_step(self.kv.used_blocks(), step_duration);

        let mut events: Vec<(Tick, Event)> = Vec::new();

        // Completions.
        let mut survivors = Batch::with_capacity(self.running_batch.len());
        for &id in &self.running_batch {
            let req = table.get(id);
            if req.is_complete() {
                let req = table.get_mut(id);
                req.state = RequestState::Completed;
                self.kv.release(id);
                self.computed_tokens.remove(&id);
                self.prefix_hashes.remove(&id);
                self.metrics.on_completion(req);
                events.push((now + step_duration, Event::RequestLeft(id)));
                debug!(
                    instance = self.id,
                    request_id = id,
                    tick = now + step_duration,
                    "request completed"
                );
            } else {
                survivors.push(id);
            }
        }
        self.running_batch = survivors;

        for (id, delay) in result.newly_scheduled {
            events.push((now + delay, Event::Scheduled(id)));
        }
        for (id, delay) in result.preempted {
            events.push((now + delay, Event::Preemption(id)));
        }

        // Schedule the next step, folding in any tier-transfer stall.
        let transfer = self.kv.consume_pending_transfer_latency();
        if !self.running_batch.is_empty() || !self.wait_queue.is_empty() {
            events.push((now + step_duration + transfer, Event::Step(self.id)));
        } else {
            self.step_pending = false;
        }

        events
    }

    /// Freeze this instance's metrics into a report.
    pub fn report(
        &self,
        sim_ended_time: Tick,
        still_queued: u64,
        still_running: u64,
        include_requests: bool,
    ) -> InstanceReport {
        self.metrics.report(
            self.id,
            sim_ended_time,
            still_queued,
            still_running,
            self.kv.total_blocks(),
            self.kv.cache_hit_rate(),
            self.kv.thrashing_rate(),
            include_requests,
        )
    }
}

/// Single-instance simulation driver: workload in, report out.
pub struct InstanceSimulator {
    table: RequestTable,
    instance: InstanceSim,
    latency: Box<dyn LatencyModel>,
    horizon: Option<Tick>,
    include_requests: bool,
}

impl InstanceSimulator {
    pub fn new(config: &SimConfig) -> Result<Self, SimError> {
        Ok(Self {
            table: RequestTable::new(),
            instance: InstanceSim::new(0, config)?,
            latency: crate::latency::build(&config.latency)?,
            horizon: config.horizon,
            include_requests: false,
        })
    }

    pub fn include_requests(mut self, include: bool) -> Self {
        self.include_requests = include;
        self
    }

    pub fn table(&self) -> &RequestTable {
        &self.table
    }

    pub fn instance(&self) -> &InstanceSim {
        &self.instance
    }

    /// Run the workload to completion (or horizon) and assemble the
    /// report.
    pub fn run(&mut self, workload: Vec<Request>) -> SimReport {
        let mut kernel = Kernel::new(self.horizon);
        for mut req in workload {
            req.assigned_instance = Some(0);
            let arrival = req.arrival_time;
            let id = req.id;
            self.table.insert(req);
            kernel.schedule(arrival, Event::Arrival(id));
        }

        let table = &mut self.table;
        let instance = &mut self.instance;
        let latency = self.latency.as_ref();
        let end = kernel.run(|now, event| match event {
            Event::Arrival(id) => instance.on_arrival(id, table, now),
            Event::Step(_) => instance.on_step(table, latency, now),
            Event::Scheduled(id) => {
                instance.on_scheduled_event(id, table, now);
                Vec::new()
            }
            Event::Preemption(_) => {
                instance.on_preemption_event();
                Vec::new()
            }
            Event::RequestLeft(id) => {
                trace!(request_id = id, tick = now, "request left");
                Vec::new()
            }
            Event::RoutingDecision(id) => {
                // No router in the single-instance path.
                trace!(request_id = id, "ignoring routing event");
                Vec::new()
            }
        });

        let mut e2e = Vec::new();
        let mut ttft = Vec::new();
        let mut itl = Vec::new();
        for id in self.table.sorted_ids() {
            let req = self.table.get(id);
            if req.state == RequestState::Completed {
                if let Some(sample) = req.e2e() {
                    e2e.push(sample);
                }
                if let Some(sample) = req.first_token_time {
                    ttft.push(sample);
                }
                itl.extend_from_slice(&req.itl);
            }
        }

        // Requests whose arrival never executed (horizon truncation) are
        // not injected and must not count as queued.
        let snapshot = self.instance.snapshot();
        let report = self.instance.report(
            end,
            snapshot.queue_depth as u64,
            snapshot.batch_size as u64,
            self.include_requests,
        );
        SimReport::assemble(end, 0, vec![report], &e2e, &ttft, &itl)
    }
}
