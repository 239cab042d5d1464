//! Multi-instance cluster simulation.
//!
//! Workload arrivals become routing decisions: admission control first,
//! then the configured policy picks a target from fresh snapshots, and
//! the request is delivered to that instance's wait queue. Each instance
//! runs its own `Step` machine; the cluster owns the single event kernel
//! and dispatches events to the right instance.

use std::collections::HashMap;

use tracing::{debug, info, trace};

use crate::config::SimConfig;
use crate::core::event::Event;
use crate::core::request::{Request, RequestId, RequestState, RequestTable, Tick};
use crate::kv::hash::block_hashes;
use crate::latency::LatencyModel;
use crate::metrics::SimReport;
use crate::router::admission::{build_admission, AdmissionPolicy, AdmissionVerdict};
use crate::router::policy::{build_policy, RoutingPolicy};
use crate::router::snapshot::RouterState;
use crate::sim::instance::InstanceSim;
use crate::sim::kernel::Kernel;
use crate::sim::SimError;

/// Cluster driver: N instances plus a router.
pub struct ClusterSimulator {
    table: RequestTable,
    instances: Vec<InstanceSim>,
    policy: Box<dyn RoutingPolicy>,
    admission: Box<dyn AdmissionPolicy>,
    latency: Box<dyn LatencyModel>,
    /// Prompt hashes at the router's block size (not the KV store's).
    router_hashes: HashMap<RequestId, Vec<u64>>,
    router_block_size: usize,
    rejected: u64,
    horizon: Option<Tick>,
    include_requests: bool,
}

impl ClusterSimulator {
    pub fn new(config: &SimConfig) -> Result<Self, SimError> {
        let instances = (0..config.cluster.instances)
            .map(|id| InstanceSim::new(id, config))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            table: RequestTable::new(),
            instances,
            policy: build_policy(&config.routing, config.cluster.instances)?,
            admission: build_admission(&config.admission),
            latency: crate::latency::build(&config.latency)?,
            router_hashes: HashMap::new(),
            router_block_size: config.routing.block_size,
            rejected: 0,
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

    pub fn instances(&self) -> &[InstanceSim] {
        &self.instances
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Run the workload through admission, routing, and the instances.
    pub fn run(&mut self, workload: Vec<Request>) -> SimReport {
        let mut kernel = Kernel::new(self.horizon);
        for req in workload {
            let arrival = req.arrival_time;
            let id = req.id;
            self.router_hashes
                .insert(id, block_hashes(&req.input_tokens, self.router_block_size));
            self.table.insert(req);
            kernel.schedule(arrival, Event::RoutingDecision(id));
        }

        info!(
            instances = self.instances.len(),
            requests = self.table.len(),
            "starting cluster simulation"
        );

        let table = &mut self.table;
        let instances = &mut self.instances;
        let policy = self.policy.as_mut();
        let admission = self.admission.as_mut();
        let latency = self.latency.as_ref();
        let router_hashes = &self.router_hashes;
        let rejected = &mut self.rejected;

        let end = kernel.run(|now, event| match event {
            Event::RoutingDecision(id) => {
                // Snapshots are sampled immediately before each decision,
                // in instance-index order.
                let state = RouterState {
                    snapshots: instances.iter().map(InstanceSim::snapshot).collect(),
                    clock: now,
                };
                let req = table.get(id);

                match admission.admit(req, &state) {
                    AdmissionVerdict::Admit => {}
                    AdmissionVerdict::Reject { reason } => {
                        debug!(request_id = id, tick = now, %reason, "request rejected");
                        table.get_mut(id).state = RequestState::Rejected;
                        *rejected += 1;
                        return Vec::new();
                    }
                }

                let empty = Vec::new();
                let hashes = router_hashes.get(&id).unwrap_or(&empty);
                let decision = policy.decide(req, hashes, &state);
                trace!(
                    request_id = id,
                    target = decision.target,
                    reason = %decision.reason,
                    "routing decision"
                );

                let req = table.get_mut(id);
                req.assigned_instance = Some(decision.target);
                if let Some(priority) = decision.priority {
                    req.priority = priority;
                }
                instances[decision.target].note_routed();
                vec![(now, Event::Arrival(id))]
            }
            Event::Arrival(id) => {
                let target = table
                    .get(id)
                    .assigned_instance
                    .expect("arrival without routing decision");
                instances[target].on_arrival(id, table, now)
            }
            Event::Step(instance_id) => instances[instance_id].on_step(table, latency, now),
            Event::Scheduled(id) => {
                if let Some(target) = table.get(id).assigned_instance {
                    instances[target].on_scheduled_event(id, table, now);
                }
                Vec::new()
            }
            Event::Preemption(id) => {
                if let Some(target) = table.get(id).assigned_instance {
                    instances[target].on_preemption_event();
                }
                Vec::new()
            }
            Event::RequestLeft(id) => {
                trace!(request_id = id, tick = now, "request left");
                Vec::new()
            }
        });

        self.assemble(end)
    }

    fn assemble(&self, end: Tick) -> SimReport {
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

        let reports = self
            .instances
            .iter()
            .map(|instance| {
                let snapshot = instance.snapshot();
                instance.report(
                    end,
                    snapshot.queue_depth as u64,
                    snapshot.batch_size as u64,
                    self.include_requests,
                )
            })
            .collect();

        SimReport::assemble(end, self.rejected, reports, &e2e, &ttft, &itl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdmissionPolicyKind, RoutingPolicyKind, SimConfig};

    fn config(instances: usize, policy: RoutingPolicyKind) -> SimConfig {
        let mut config = SimConfig::default();
        config.cluster.instances = instances;
        config.routing.policy = policy;
        config.kv_cache.total_blocks = 128;
        config.batch.max_running_reqs = 8;
        config.batch.max_scheduled_tokens = 2048;
        config
    }

    fn request(id: RequestId, input: usize, output: usize, arrival: Tick) -> Request {
        let mut req = Request::new(id, (0..input as u32).collect(), vec![1; output]);
        req.arrival_time = arrival;
        req
    }

    #[test]
    fn test_round_robin_spreads_arrivals() {
        let mut sim = ClusterSimulator::new(&config(2, RoutingPolicyKind::RoundRobin)).unwrap();
        let workload = (0..4).map(|i| request(i + 1, 32, 2, i * 10)).collect();
        let report = sim.run(workload);

        assert_eq!(report.completed, 4);
        assert_eq!(sim.table().get(1).assigned_instance, Some(0));
        assert_eq!(sim.table().get(2).assigned_instance, Some(1));
        assert_eq!(sim.table().get(3).assigned_instance, Some(0));
        assert_eq!(sim.table().get(4).assigned_instance, Some(1));
    }

    #[test]
    fn test_least_loaded_ties_to_first_instance() {
        let mut sim = ClusterSimulator::new(&config(2, RoutingPolicyKind::LeastLoaded)).unwrap();
        // Far-apart arrivals: each decision sees two idle instances.
        let workload = (0..3)
            .map(|i| request(i + 1, 16, 1, i * 100_000_000))
            .collect();
        let report = sim.run(workload);

        assert_eq!(report.completed, 3);
        for id in 1..=3 {
            assert_eq!(sim.table().get(id).assigned_instance, Some(0));
        }
    }

    #[test]
    fn test_reject_all_counts_rejections() {
        let mut config = config(2, RoutingPolicyKind::RoundRobin);
        config.admission.policy = AdmissionPolicyKind::RejectAll;
        let mut sim = ClusterSimulator::new(&config).unwrap();
        let report = sim.run((0..5).map(|i| request(i + 1, 16, 1, i * 10)).collect());

        assert_eq!(report.rejected, 5);
        assert_eq!(report.completed, 0);
        assert_eq!(report.injected, 5);
        assert_eq!(
            report.injected,
            report.completed
                + report.still_queued
                + report.still_running
                + report.dropped_unservable
                + report.rejected
        );
    }

    #[test]
    fn test_conservation_across_instances() {
        let mut sim = ClusterSimulator::new(&config(3, RoutingPolicyKind::Weighted)).unwrap();
        let workload = (0..30).map(|i| request(i + 1, 24 + (i as usize % 5) * 8, 3, i * 2_000)).collect();
        let report = sim.run(workload);

        assert_eq!(
            report.injected,
            report.completed
                + report.still_queued
                + report.still_running
                + report.dropped_unservable
                + report.rejected
        );
        assert_eq!(report.completed, 30);
    }

    #[test]
    fn test_cluster_determinism() {
        let make = || {
            let mut sim =
                ClusterSimulator::new(&config(2, RoutingPolicyKind::AdaptiveWeighted)).unwrap();
            let workload = (0..25)
                .map(|i| request(i + 1, 16 + (i as usize * 13) % 96, 4, i * 3_000))
                .collect();
            sim.run(workload).to_json().unwrap()
        };
        assert_eq!(make(), make());
    }
}
