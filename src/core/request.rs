//! Request and batch value types.
//!
//! A [`Request`] is the unit of work flowing through the simulator: it
//! carries the prompt and (pre-known) completion tokens, its lifecycle
//! state, and the per-token latency ledger that metrics are computed from.
//! Requests are owned by a single [`RequestTable`]; queues and batches hold
//! [`RequestId`] handles, never the requests themselves.

use serde::{Deserialize, Serialize};

/// Simulated time in microseconds.
pub type Tick = u64;

/// Unique identifier for a request, assigned by the workload source.
pub type RequestId = u64;

/// Index of a serving instance within a cluster.
pub type InstanceId = usize;

/// The running batch is an ordered list of request handles.
pub type Batch = Vec<RequestId>;

/// SLO class attached to a request by the workload. Routing and admission
/// treat classes differently; the empty/unclassified case is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SloClass {
    Critical,
    Standard,
    Sheddable,
    Batch,
    Background,
    #[default]
    #[serde(rename = "")]
    None,
}

impl SloClass {
    /// Parse a workload/config label. Unknown labels map to `None` so
    /// traces with free-form class columns still load.
    pub fn parse(label: &str) -> Self {
        match label {
            "critical" => SloClass::Critical,
            "standard" => SloClass::Standard,
            "sheddable" => SloClass::Sheddable,
            "batch" => SloClass::Batch,
            "background" => SloClass::Background,
            _ => SloClass::None,
        }
    }

    /// All classes in a fixed order, used to build per-class router
    /// profiles deterministically.
    pub const ALL: [SloClass; 6] = [
        SloClass::Critical,
        SloClass::Standard,
        SloClass::Sheddable,
        SloClass::Batch,
        SloClass::Background,
        SloClass::None,
    ];
}

impl std::fmt::Display for SloClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SloClass::Critical => write!(f, "critical"),
            SloClass::Standard => write!(f, "standard"),
            SloClass::Sheddable => write!(f, "sheddable"),
            SloClass::Batch => write!(f, "batch"),
            SloClass::Background => write!(f, "background"),
            SloClass::None => write!(f, ""),
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in an instance's wait queue (or not yet arrived).
    Queued,
    /// Member of a running batch.
    Running,
    /// All tokens produced; retained for metrics.
    Completed,
    /// Dropped as unservable (larger than total KV capacity).
    Dropped,
    /// Turned away by admission control; never reached an instance.
    Rejected,
}

/// One inference request.
///
/// `progress_index` counts total tokens computed so far: the consumed
/// prompt prefix plus emitted output tokens. A request completes when it
/// reaches `|input| + max(|output|, 1) - 1`: the final prefill step
/// produces the first output token, so an N-token completion needs N-1
/// decode steps after the prefill boundary.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub input_tokens: Vec<u32>,
    pub output_tokens: Vec<u32>,
    pub arrival_time: Tick,
    pub state: RequestState,

    /// Total tokens computed (prompt prefix consumed + outputs emitted).
    pub progress_index: usize,

    /// Tokens to process in the current step. Written by batch formation,
    /// read by the latency model.
    pub num_new_tokens: usize,

    /// Time from arrival to first output token, set exactly once at the
    /// prefill boundary.
    pub first_token_time: Option<Tick>,

    /// Inter-token latencies, one sample per decode step.
    pub itl: Vec<Tick>,

    /// Scheduling priority, recomputed each step. Higher is more urgent.
    pub priority: f64,

    /// Delay between arrival and the `Scheduled` event, recorded once.
    pub scheduling_delay: Option<Tick>,

    /// Times this request was tail-evicted back to the wait queue.
    pub preemption_count: u32,

    pub slo_class: SloClass,
    pub assigned_instance: Option<InstanceId>,
    pub model: String,
    pub tenant_id: String,
}

impl Request {
    pub fn new(id: RequestId, input_tokens: Vec<u32>, output_tokens: Vec<u32>) -> Self {
        Self {
            id,
            input_tokens,
            output_tokens,
            arrival_time: 0,
            state: RequestState::Queued,
            progress_index: 0,
            num_new_tokens: 0,
            first_token_time: None,
            itl: Vec::new(),
            priority: 0.0,
            scheduling_delay: None,
            preemption_count: 0,
            slo_class: SloClass::None,
            assigned_instance: None,
            model: String::new(),
            tenant_id: String::new(),
        }
    }

    pub fn input_len(&self) -> usize {
        self.input_tokens.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_tokens.len()
    }

    /// Progress index at which the request is complete.
    pub fn completion_progress(&self) -> usize {
        self.input_len() + self.output_len().max(1) - 1
    }

    /// Whether the prompt is still being consumed.
    pub fn in_prefill(&self) -> bool {
        self.progress_index < self.input_len()
    }

    pub fn is_complete(&self) -> bool {
        self.progress_index >= self.completion_progress()
    }

    /// Highest token position the request will ever need KV coverage for.
    /// The last decode step allocates up to (but not including) the
    /// completion index plus one.
    pub fn peak_kv_tokens(&self) -> usize {
        self.completion_progress().max(self.input_len())
    }

    /// Blocks needed at peak occupancy for a given block size.
    pub fn peak_kv_blocks(&self, block_size: usize) -> usize {
        self.peak_kv_tokens().div_ceil(block_size)
    }

    /// End-to-end latency, defined once the request completed.
    pub fn e2e(&self) -> Option<Tick> {
        self.first_token_time
            .map(|ttft| ttft + self.itl.iter().sum::<Tick>())
    }

    /// Mean inter-token latency. Zero for requests with at most one output
    /// token, which finish at the prefill boundary with no ITL samples.
    pub fn mean_itl(&self) -> f64 {
        if self.itl.is_empty() {
            return 0.0;
        }
        let e2e = self.e2e().unwrap_or(0);
        let ttft = self.first_token_time.unwrap_or(0);
        (e2e - ttft) as f64 / (self.output_len().saturating_sub(1)).max(1) as f64
    }
}

/// The single owning table of requests, keyed by ID. Everything else holds
/// `RequestId` handles into this table.
#[derive(Debug, Default)]
pub struct RequestTable {
    requests: std::collections::HashMap<RequestId, Request>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: Request) {
        self.requests.insert(request.id, request);
    }

    pub fn get(&self, id: RequestId) -> &Request {
        &self.requests[&id]
    }

    pub fn get_mut(&mut self, id: RequestId) -> &mut Request {
        self.requests.get_mut(&id).expect("unknown request id")
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// IDs in ascending order. Metrics iterate this, never the raw map, so
    /// output ordering is deterministic.
    pub fn sorted_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Aggregate features of a formed batch, consumed by the latency model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchFeatures {
    /// Prefill tokens not served from cache this step.
    pub cache_miss_tokens: usize,
    /// Decode tokens (one per decoding request).
    pub decode_tokens: usize,
    pub num_prefill_reqs: usize,
    pub num_decode_reqs: usize,
    /// Largest single-request prefill chunk in the batch.
    pub max_prefill_tokens: usize,
    /// Total context tokens behind the decoding requests (attention reads
    /// this much KV history).
    pub decode_context_tokens: usize,
}

impl BatchFeatures {
    /// Derive features from the formed batch. `num_new_tokens` must already
    /// be set by batch formation.
    pub fn from_batch(batch: &[RequestId], table: &RequestTable) -> Self {
        let mut features = BatchFeatures::default();
        for &id in batch {
            let req = table.get(id);
            if req.in_prefill() {
                features.num_prefill_reqs += 1;
                features.cache_miss_tokens += req.num_new_tokens;
                features.max_prefill_tokens = features.max_prefill_tokens.max(req.num_new_tokens);
            } else {
                features.num_decode_reqs += 1;
                features.decode_tokens += req.num_new_tokens;
                features.decode_context_tokens += req.progress_index;
            }
        }
        features
    }
}
