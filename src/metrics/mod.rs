//! Per-request timing aggregation and the JSON report.
//!
//! Internally everything is ticks (microseconds); conversion to
//! milliseconds happens once, at the serialization boundary. Percentiles
//! are nearest-rank over sorted samples. Report field order is fixed by
//! the struct definitions, so identical runs serialize identical bytes.

use serde::Serialize;

use crate::core::request::{Request, Tick};

/// Nearest-rank percentile over an already-sorted sample slice.
pub fn percentile(sorted: &[Tick], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index] as f64
}

fn to_ms(ticks: f64) -> f64 {
    ticks / 1_000.0
}

/// Mean and tail percentiles of one latency distribution, in
/// milliseconds.
#[derive(Debug, Clone, Serialize, Default)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[Tick]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let sum: u128 = sorted.iter().map(|&t| t as u128).sum();
        Self {
            mean_ms: to_ms(sum as f64 / sorted.len() as f64),
            p90_ms: to_ms(percentile(&sorted, 90.0)),
            p95_ms: to_ms(percentile(&sorted, 95.0)),
            p99_ms: to_ms(percentile(&sorted, 99.0)),
        }
    }
}

/// Per-request entry in the optional `requests` array.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: u64,
    pub ttft_ms: f64,
    pub itl_ms: f64,
    pub e2e_ms: f64,
    pub scheduling_delay_ms: f64,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub preemptions: u32,
    pub slo_class: String,
    pub tenant: String,
    pub model: String,
}

impl RequestRecord {
    pub fn from_request(req: &Request) -> Self {
        Self {
            id: req.id,
            ttft_ms: to_ms(req.first_token_time.unwrap_or(0) as f64),
            itl_ms: to_ms(req.mean_itl()),
            e2e_ms: to_ms(req.e2e().unwrap_or(0) as f64),
            scheduling_delay_ms: to_ms(req.scheduling_delay.unwrap_or(0) as f64),
            input_tokens: req.input_len(),
            output_tokens: req.output_len(),
            preemptions: req.preemption_count,
            slo_class: req.slo_class.to_string(),
            tenant: req.tenant_id.clone(),
            model: req.model.clone(),
        }
    }
}

/// Running accumulator for one instance.
#[derive(Debug, Default)]
pub struct InstanceMetrics {
    pub injected: u64,
    pub completed: u64,
    pub dropped_unservable: u64,
    pub preemptions: u64,
    pub steps: u64,

    pub total_input_tokens: u64,
    pub total_output_tokens: u64,

    ttft_samples: Vec<Tick>,
    e2e_samples: Vec<Tick>,
    itl_samples: Vec<Tick>,
    scheduling_delays: Vec<Tick>,

    pub peak_kv_used_blocks: usize,
    /// Time integral of used blocks (block-ticks), for mean occupancy.
    kv_occupancy_integral: u128,
    observed_ticks: Tick,

    records: Vec<RequestRecord>,
}

impl InstanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_arrival(&mut self, input_tokens: usize) {
        self.injected += 1;
        self.total_input_tokens += input_tokens as u64;
    }

    pub fn on_output_token(&mut self) {
        self.total_output_tokens += 1;
    }

    pub fn on_scheduled(&mut self, delay: Tick) {
        self.scheduling_delays.push(delay);
    }

    pub fn on_preemption(&mut self) {
        self.preemptions += 1;
    }

    pub fn on_drop(&mut self) {
        self.dropped_unservable += 1;
    }

    /// Account one executed step: KV pressure integrates used blocks over
    /// the step duration.
    pub fn on_step(&mut self, used_blocks: usize, duration: Tick) {
        self.steps += 1;
        self.peak_kv_used_blocks = self.peak_kv_used_blocks.max(used_blocks);
        self.kv_occupancy_integral += used_blocks as u128 * duration as u128;
        self.observed_ticks += duration;
    }

    pub fn on_completion(&mut self, req: &Request) {
        self.completed += 1;
        if let Some(ttft) = req.first_token_time {
            self.ttft_samples.push(ttft);
        }
        if let Some(e2e) = req.e2e() {
            self.e2e_samples.push(e2e);
        }
        self.itl_samples.extend_from_slice(&req.itl);
        self.records.push(RequestRecord::from_request(req));
    }

    /// Mean fraction of the KV arena in use over observed step time.
    pub fn mean_kv_utilization(&self, total_blocks: usize) -> f64 {
        if self.observed_ticks == 0 || total_blocks == 0 {
            return 0.0;
        }
        self.kv_occupancy_integral as f64 / (total_blocks as f64 * self.observed_ticks as f64)
    }

    /// Freeze into the serializable report.
    #[allow(clippy::too_many_arguments)]
    pub fn report(
        &self,
        instance_id: usize,
        sim_ended_time: Tick,
        still_queued: u64,
        still_running: u64,
        total_blocks: usize,
        cache_hit_rate: f64,
        kv_thrashing_rate: f64,
        include_requests: bool,
    ) -> InstanceReport {
        let duration_s = sim_ended_time as f64 / 1e6;
        let mut sorted_delays = self.scheduling_delays.clone();
        sorted_delays.sort_unstable();

        InstanceReport {
            instance_id,
            completed: self.completed,
            still_queued,
            still_running,
            dropped_unservable: self.dropped_unservable,
            injected: self.injected,
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            vllm_estimated_duration_s: duration_s,
            responses_per_sec: if duration_s > 0.0 {
                self.completed as f64 / duration_s
            } else {
                0.0
            },
            tokens_per_sec: if duration_s > 0.0 {
                self.total_output_tokens as f64 / duration_s
            } else {
                0.0
            },
            e2e: LatencySummary::from_samples(&self.e2e_samples),
            ttft: LatencySummary::from_samples(&self.ttft_samples),
            itl: LatencySummary::from_samples(&self.itl_samples),
            scheduling_delay_p99_ms: to_ms(percentile(&sorted_delays, 99.0)),
            preemptions: self.preemptions,
            steps: self.steps,
            kv_peak_used_blocks: self.peak_kv_used_blocks,
            kv_mean_utilization: self.mean_kv_utilization(total_blocks),
            cache_hit_rate,
            kv_thrashing_rate,
            requests: include_requests.then(|| {
                let mut records = self.records.clone();
                records.sort_by_key(|r| r.id);
                records
            }),
        }
    }
}

/// JSON report for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance_id: usize,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    /// Conservation identity: completed + still_queued + still_running +
    /// dropped_unservable.
    pub injected: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub vllm_estimated_duration_s: f64,
    pub responses_per_sec: f64,
    pub tokens_per_sec: f64,
    pub e2e: LatencySummary,
    pub ttft: LatencySummary,
    pub itl: LatencySummary,
    pub scheduling_delay_p99_ms: f64,
    pub preemptions: u64,
    pub steps: u64,
    pub kv_peak_used_blocks: usize,
    pub kv_mean_utilization: f64,
    pub cache_hit_rate: f64,
    pub kv_thrashing_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<Vec<RequestRecord>>,
}

/// Whole-simulation report: aggregate totals plus one entry per instance.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub sim_ended_time_s: f64,
    pub injected: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    pub rejected: u64,
    pub responses_per_sec: f64,
    pub tokens_per_sec: f64,
    /// Unweighted mean of per-instance rates; can under-report under
    /// imbalanced load.
    pub cache_hit_rate: f64,
    pub e2e: LatencySummary,
    pub ttft: LatencySummary,
    pub itl: LatencySummary,
    pub instances: Vec<InstanceReport>,
}

impl SimReport {
    /// Merge instance reports and global sample pools into the final
    /// document.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        sim_ended_time: Tick,
        rejected: u64,
        instances: Vec<InstanceReport>,
        e2e_samples: &[Tick],
        ttft_samples: &[Tick],
        itl_samples: &[Tick],
    ) -> Self {
        let duration_s = sim_ended_time as f64 / 1e6;
        let completed: u64 = instances.iter().map(|i| i.completed).sum();
        let total_output: u64 = instances.iter().map(|i| i.total_output_tokens).sum();
        let hit_rate = if instances.is_empty() {
            0.0
        } else {
            instances.iter().map(|i| i.cache_hit_rate).sum::<f64>() / instances.len() as f64
        };

        Self {
            sim_ended_time_s: duration_s,
            injected: instances.iter().map(|i| i.injected).sum::<u64>() + rejected,
            completed,
            still_queued: instances.iter().map(|i| i.still_queued).sum(),
            still_running: instances.iter().map(|i| i.still_running).sum(),
            dropped_unservable: instances.iter().map(|i| i.dropped_unservable).sum(),
            rejected,
            responses_per_sec: if duration_s > 0.0 {
                completed as f64 / duration_s
            } else {
                0.0
            },
            tokens_per_sec: if duration_s > 0.0 {
                total_output as f64 / duration_s
            } else {
                0.0
            },
            cache_hit_rate: hit_rate,
            e2e: LatencySummary::from_samples(e2e_samples),
            ttft: LatencySummary::from_samples(ttft_samples),
            itl: LatencySummary::from_samples(itl_samples),
            instances,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
