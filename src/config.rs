//! Runtime configuration for servesim.
//!
//! Configuration is a YAML (or JSON) bundle mirroring the simulator's
//! component groups: routing, admission, scheduling, KV cache, batching,
//! latency model, and the synthetic workload. Every group has defaults and
//! a `validate()`; validation failures surface before the simulation
//! starts and name the offending field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::request::Tick;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("routing.scorers: unknown scorer {0:?}")]
    UnknownScorer(String),

    #[error("routing.scorers: duplicate scorer {0:?}")]
    DuplicateScorer(String),

    #[error("routing.scorers: weight for {name:?} must be finite and positive, got {weight}")]
    BadScorerWeight { name: String, weight: f64 },

    #[error("routing.block_size must be nonzero")]
    ZeroRoutingBlockSize,

    #[error("admission.{field} must be finite and non-negative, got {value}")]
    BadAdmissionValue { field: &'static str, value: f64 },

    #[error("batch.max_running_reqs must be nonzero")]
    ZeroBatchSize,

    #[error("batch.max_scheduled_tokens must be nonzero")]
    ZeroTokenBudget,

    #[error("latency: exactly one of `blackbox` or `roofline` must be set")]
    AmbiguousLatency,

    #[error("latency.blackbox.{field} needs at least 3 coefficients, got {got}")]
    ShortCoefficients { field: &'static str, got: usize },

    #[error("latency.roofline.tp must be nonzero")]
    ZeroTensorParallel,

    #[error("workload.{field} must be positive, got {value}")]
    BadWorkloadValue { field: &'static str, value: f64 },

    #[error("cluster.instances must be nonzero")]
    ZeroInstances,
}

/// Command-line arguments. Flags override the corresponding config fields.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "servesim",
    about = "Discrete-event simulator for LLM serving engines"
)]
pub struct Cli {
    /// Path to a YAML or JSON configuration bundle.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Workload trace CSV. Without it the synthetic generator is used.
    #[arg(short, long)]
    pub workload: Option<PathBuf>,

    /// Write the JSON metrics report here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Stop the simulation once the clock passes this tick.
    #[arg(long)]
    pub horizon: Option<Tick>,

    /// RNG seed for the synthetic workload.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of serving instances (1 = single-instance simulator).
    #[arg(long)]
    pub instances: Option<usize>,

    /// Routing policy: round-robin | least-loaded | weighted | adaptive-weighted.
    #[arg(long)]
    pub routing_policy: Option<RoutingPolicyKind>,

    /// Admission policy: always-admit | token-bucket | slo-gated | reject-all.
    #[arg(long)]
    pub admission_policy: Option<AdmissionPolicyKind>,

    /// Queue reorderer: fcfs | priority-fcfs | sjf.
    #[arg(long)]
    pub scheduler: Option<SchedulerKind>,

    /// Priority policy: constant | slo-based | inverted-slo.
    #[arg(long)]
    pub priority_policy: Option<PriorityPolicyKind>,

    /// KV cache capacity in blocks.
    #[arg(long)]
    pub total_blocks: Option<usize>,

    /// Tokens per KV block.
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Batch-size cap per step.
    #[arg(long)]
    pub max_running_reqs: Option<usize>,

    /// Token budget per step.
    #[arg(long)]
    pub max_scheduled_tokens: Option<usize>,

    /// Chunked-prefill split threshold (0 disables).
    #[arg(long)]
    pub prefill_threshold: Option<usize>,

    /// Include per-request records in the JSON report.
    #[arg(long)]
    pub include_requests: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration bundle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SimConfig {
    pub cluster: ClusterConfig,
    pub routing: RoutingConfig,
    pub admission: AdmissionConfig,
    pub scheduler: SchedulerKind,
    pub priority: PriorityConfig,
    pub kv_cache: KvCacheConfig,
    pub batch: BatchConfig,
    pub latency: LatencyConfig,
    pub workload: SyntheticWorkloadConfig,

    /// Stop once the clock exceeds this tick. `None` runs to completion.
    pub horizon: Option<Tick>,

    /// Seed for every RNG in the run.
    pub seed: u64,
}

/// Cluster shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of serving instances.
    pub instances: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { instances: 1 }
    }
}

/// Routing policy selection and scorer weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub policy: RoutingPolicyKind,

    /// Scorers for the `weighted` policy (and the base set for
    /// `adaptive-weighted` profiles that don't override them).
    pub scorers: Vec<ScorerWeight>,

    /// Block size used by the router-side prefix index.
    pub block_size: usize,

    /// Capacity (block hashes per instance) of the router-side prefix
    /// index.
    pub affinity_capacity: usize,

    /// Per-SLO-class overrides for `adaptive-weighted`. Classes absent
    /// here use built-in profiles.
    pub profiles: BTreeMap<String, SloProfileConfig>,

    /// Thrashing rate above which adaptive routing penalizes an instance.
    pub thrashing_penalty_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: RoutingPolicyKind::RoundRobin,
            scorers: vec![
                ScorerWeight::new("queue-depth", 1.0),
                ScorerWeight::new("kv-utilization", 1.0),
                ScorerWeight::new("load-balance", 1.0),
            ],
            block_size: 16,
            affinity_capacity: 4096,
            profiles: BTreeMap::new(),
            thrashing_penalty_threshold: 0.3,
        }
    }
}

/// One named scorer with its weight in the composite score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorerWeight {
    pub name: String,
    pub weight: f64,
}

impl ScorerWeight {
    pub fn new(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

/// Per-SLO-class routing profile override.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SloProfileConfig {
    pub scorers: Vec<ScorerWeight>,

    /// If the chosen instance is more than this many load units above the
    /// least-loaded one, redirect to the least-loaded. `None` disables the
    /// check.
    pub max_load_headroom: Option<f64>,
}

pub const SCORER_NAMES: [&str; 5] = [
    "queue-depth",
    "kv-utilization",
    "load-balance",
    "prefix-affinity",
    "slo-priority",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicyKind {
    #[default]
    RoundRobin,
    LeastLoaded,
    Weighted,
    AdaptiveWeighted,
}

/// Admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub policy: AdmissionPolicyKind,

    /// Token-bucket capacity (tokens).
    pub capacity: f64,

    /// Token-bucket refill rate (tokens per second).
    pub refill_rate: f64,

    /// One bucket per tenant instead of a global bucket.
    pub per_tenant: bool,

    /// slo-gated: shed sheddable requests above this mean effective load.
    pub load_threshold: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policy: AdmissionPolicyKind::AlwaysAdmit,
            capacity: 100_000.0,
            refill_rate: 50_000.0,
            per_tenant: false,
            load_threshold: 16.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicyKind {
    #[default]
    AlwaysAdmit,
    TokenBucket,
    SloGated,
    RejectAll,
}

/// Wait-queue reordering discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    Fcfs,
    PriorityFcfs,
    Sjf,
}

/// Priority computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub policy: PriorityPolicyKind,

    /// Priority gained per tick of queue age (slo-based policies).
    pub age_weight: f64,

    /// Base priority per SLO class; classes absent here use built-ins.
    pub class_base: BTreeMap<String, f64>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            policy: PriorityPolicyKind::Constant,
            age_weight: 0.001,
            class_base: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityPolicyKind {
    #[default]
    Constant,
    SloBased,
    InvertedSlo,
}

/// KV cache sizing and the optional slow tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    /// Fast-tier capacity in blocks.
    pub total_blocks: usize,

    /// Tokens per block.
    pub block_size_tokens: usize,

    /// Slow-tier capacity in blocks. `None` (or 0) disables the tier.
    pub cpu_blocks: Option<usize>,

    /// Fast-tier utilization at or above which evictions spill to the
    /// slow tier instead of discarding content.
    pub offload_threshold: f64,

    /// Slow-to-fast transfer bandwidth, blocks per millisecond.
    pub transfer_bandwidth: f64,

    /// Fixed cost per transfer batch, ticks.
    pub base_latency: Tick,

    /// Sliding window for the thrashing rate, ticks.
    pub thrashing_window: Tick,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            total_blocks: 512,
            block_size_tokens: 16,
            cpu_blocks: None,
            offload_threshold: 0.8,
            transfer_bandwidth: 1.0,
            base_latency: 100,
            thrashing_window: 50_000,
        }
    }
}

impl KvCacheConfig {
    /// Total tokens the fast tier can hold.
    pub fn fast_tier_tokens(&self) -> usize {
        self.total_blocks * self.block_size_tokens
    }
}

/// Per-step batching budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Batch-size cap.
    pub max_running_reqs: usize,

    /// Token budget per step.
    pub max_scheduled_tokens: usize,

    /// Chunked-prefill split threshold; 0 disables chunking.
    pub long_prefill_token_threshold: usize,

    /// Override threshold for critical requests (smaller chunks keep the
    /// batch responsive).
    pub critical_prefill_token_threshold: Option<usize>,

    /// Override threshold for batch/sheddable/background requests.
    pub relaxed_prefill_token_threshold: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_running_reqs: 256,
            max_scheduled_tokens: 2048,
            long_prefill_token_threshold: 0,
            critical_prefill_token_threshold: None,
            relaxed_prefill_token_threshold: None,
        }
    }
}

/// Latency model selection: exactly one variant must be configured.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LatencyConfig {
    pub blackbox: Option<BlackboxConfig>,
    pub roofline: Option<RooflineConfig>,
}

impl LatencyConfig {
    /// The effective config: defaults to blackbox when neither variant is
    /// set.
    pub fn effective(&self) -> LatencyConfig {
        if self.blackbox.is_none() && self.roofline.is_none() {
            return LatencyConfig {
                blackbox: Some(BlackboxConfig::default()),
                roofline: None,
            };
        }
        self.clone()
    }
}

/// Regression-based latency model coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboxConfig {
    /// Step time: beta[0] + beta[1] * cache_miss_tokens + beta[2] * decode_tokens.
    pub beta: Vec<f64>,

    /// alpha[0] + alpha[1] * input_len = queueing time; alpha[2] = output
    /// token processing time.
    pub alpha: Vec<f64>,

    /// Overhead charged to newly scheduled requests, ticks.
    pub scheduling_overhead: Tick,

    /// Overhead charged to preempted requests, ticks.
    pub preemption_overhead: Tick,
}

impl Default for BlackboxConfig {
    fn default() -> Self {
        Self {
            beta: vec![1_000.0, 20.0, 10.0],
            alpha: vec![50.0, 0.5, 30.0],
            scheduling_overhead: 0,
            preemption_overhead: 0,
        }
    }
}

/// Analytical roofline latency model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RooflineConfig {
    /// Model name (built-in spec table).
    pub model: String,

    /// GPU name (built-in spec table).
    pub gpu: String,

    /// Tensor-parallel degree.
    pub tp: usize,

    /// Root directory of the MFU benchmark CSVs.
    pub bench_data_path: PathBuf,

    /// Fraction of peak memory bandwidth actually achieved.
    pub bw_efficiency: f64,

    /// CPU-side overhead per transformer layer per step, microseconds.
    pub per_layer_cpu_overhead_us: f64,
}

impl Default for RooflineConfig {
    fn default() -> Self {
        Self {
            model: "llama-3-8b".to_string(),
            gpu: "h100".to_string(),
            tp: 1,
            bench_data_path: PathBuf::from("bench_data"),
            bw_efficiency: 0.8,
            per_layer_cpu_overhead_us: 5.0,
        }
    }
}

/// Distribution-based workload generator parameters, used when no trace
/// is supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticWorkloadConfig {
    /// Request rate, requests per second.
    pub rate: f64,

    /// Shared prefix length prepended to every prompt.
    pub prefix_tokens: usize,

    pub prompt_mean: f64,
    pub prompt_stddev: f64,
    pub prompt_min: usize,
    pub prompt_max: usize,

    pub output_mean: f64,
    pub output_stddev: f64,
    pub output_min: usize,
    pub output_max: usize,

    /// Number of requests to generate.
    pub max_prompts: usize,
}

impl Default for SyntheticWorkloadConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            prefix_tokens: 0,
            prompt_mean: 512.0,
            prompt_stddev: 128.0,
            prompt_min: 16,
            prompt_max: 4096,
            output_mean: 128.0,
            output_stddev: 64.0,
            output_min: 1,
            output_max: 1024,
            max_prompts: 100,
        }
    }
}

impl SimConfig {
    /// Load a bundle from YAML or JSON, chosen by file extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: SimConfig = if is_json {
            serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Apply CLI flag overrides on top of the loaded bundle.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(horizon) = cli.horizon {
            self.horizon = Some(horizon);
        }
        if let Some(seed) = cli.seed {
            self.seed = seed;
        }
        if let Some(instances) = cli.instances {
            self.cluster.instances = instances;
        }
        if let Some(policy) = cli.routing_policy {
            self.routing.policy = policy;
        }
        if let Some(policy) = cli.admission_policy {
            self.admission.policy = policy;
        }
        if let Some(scheduler) = cli.scheduler {
            self.scheduler = scheduler;
        }
        if let Some(policy) = cli.priority_policy {
            self.priority.policy = policy;
        }
        if let Some(total_blocks) = cli.total_blocks {
            self.kv_cache.total_blocks = total_blocks;
        }
        if let Some(block_size) = cli.block_size {
            self.kv_cache.block_size_tokens = block_size;
        }
        if let Some(max_running) = cli.max_running_reqs {
            self.batch.max_running_reqs = max_running;
        }
        if let Some(budget) = cli.max_scheduled_tokens {
            self.batch.max_scheduled_tokens = budget;
        }
        if let Some(threshold) = cli.prefill_threshold {
            self.batch.long_prefill_token_threshold = threshold;
        }
    }

    /// Whole-bundle validation. Called by `load`; call again after CLI
    /// overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.instances == 0 {
            return Err(ConfigError::ZeroInstances);
        }

        if self.routing.block_size == 0 {
            return Err(ConfigError::ZeroRoutingBlockSize);
        }
        validate_scorers(&self.routing.scorers)?;
        for profile in self.routing.profiles.values() {
            validate_scorers(&profile.scorers)?;
        }

        for (field, value) in [
            ("capacity", self.admission.capacity),
            ("refill_rate", self.admission.refill_rate),
            ("load_threshold", self.admission.load_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::BadAdmissionValue { field, value });
            }
        }

        if self.batch.max_running_reqs == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.batch.max_scheduled_tokens == 0 {
            return Err(ConfigError::ZeroTokenBudget);
        }

        let latency = self.latency.effective();
        match (&latency.blackbox, &latency.roofline) {
            (Some(blackbox), None) => {
                if blackbox.beta.len() < 3 {
                    return Err(ConfigError::ShortCoefficients {
                        field: "beta",
                        got: blackbox.beta.len(),
                    });
                }
                if blackbox.alpha.len() < 3 {
                    return Err(ConfigError::ShortCoefficients {
                        field: "alpha",
                        got: blackbox.alpha.len(),
                    });
                }
            }
            (None, Some(roofline)) => {
                if roofline.tp == 0 {
                    return Err(ConfigError::ZeroTensorParallel);
                }
            }
            _ => return Err(ConfigError::AmbiguousLatency),
        }

        for (field, value) in [
            ("rate", self.workload.rate),
            ("prompt_mean", self.workload.prompt_mean),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::BadWorkloadValue { field, value });
            }
        }

        Ok(())
    }
}

fn validate_scorers(scorers: &[ScorerWeight]) -> Result<(), ConfigError> {
    let mut seen = Vec::new();
    for scorer in scorers {
        if !SCORER_NAMES.contains(&scorer.name.as_str()) {
            return Err(ConfigError::UnknownScorer(scorer.name.clone()));
        }
        if seen.contains(&scorer.name.as_str()) {
            return Err(ConfigError::DuplicateScorer(scorer.name.clone()));
        }
        if !scorer.weight.is_finite() || scorer.weight <= 0.0 {
            return Err(ConfigError::BadScorerWeight {
                name: scorer.name.clone(),
                weight: scorer.weight,
            });
        }
        seen.push(scorer.name.as_str());
    }
    Ok(())
}
