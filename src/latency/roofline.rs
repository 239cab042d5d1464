//! Analytical roofline latency model.
//!
//! Step time is derived from first principles: per-layer FLOP counts for
//! the projections (QKV, output, SwiGLU MLP) and FlashAttention, and
//! memory traffic for weights and KV history. Each portion of the batch
//! (prefill, decode) takes `max(compute, memory)` seconds plus a per-layer
//! CPU overhead; the two portions are summed. Peak FLOPs are scaled by
//! measured MFU from the [`MfuDatabase`]; peak bandwidth by a fixed
//! efficiency factor.

use crate::config::RooflineConfig;
use crate::core::request::{BatchFeatures, Tick};
use crate::latency::mfu::MfuDatabase;
use crate::latency::{LatencyError, LatencyModel};

/// Architecture parameters of a served model.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub layers: usize,
    pub hidden: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub intermediate: usize,
    /// Total parameter count.
    pub params: f64,
}

/// Peak hardware numbers for a GPU.
#[derive(Debug, Clone, Copy)]
pub struct GpuSpec {
    /// Dense BF16 peak, FLOP/s.
    pub peak_flops: f64,
    /// HBM bandwidth, bytes/s.
    pub mem_bandwidth: f64,
}

/// Built-in model table. Unknown names are construction-time errors.
pub fn builtin_model(name: &str) -> Option<ModelSpec> {
    match name {
        "llama-3-8b" => Some(ModelSpec {
            layers: 32,
            hidden: 4096,
            heads: 32,
            kv_heads: 8,
            head_dim: 128,
            intermediate: 14336,
            params: 8.03e9,
        }),
        "llama-3-70b" => Some(ModelSpec {
            layers: 80,
            hidden: 8192,
            heads: 64,
            kv_heads: 8,
            head_dim: 128,
            intermediate: 28672,
            params: 70.6e9,
        }),
        "qwen-2.5-7b" => Some(ModelSpec {
            layers: 28,
            hidden: 3584,
            heads: 28,
            kv_heads: 4,
            head_dim: 128,
            intermediate: 18944,
            params: 7.62e9,
        }),
        _ => None,
    }
}

/// Built-in GPU table.
pub fn builtin_gpu(name: &str) -> Option<GpuSpec> {
    match name {
        "h100" => Some(GpuSpec {
            peak_flops: 989e12,
            mem_bandwidth: 3.35e12,
        }),
        "a100" => Some(GpuSpec {
            peak_flops: 312e12,
            mem_bandwidth: 2.0e12,
        }),
        "a10g" => Some(GpuSpec {
            peak_flops: 125e12,
            mem_bandwidth: 600e9,
        }),
        _ => None,
    }
}

// Guard against a zero MFU sample turning a division into infinity.
const MFU_FLOOR: f64 = 1e-3;

/// Roofline model over a (model, GPU, TP) deployment.
pub struct RooflineModel {
    model: ModelSpec,
    gpu: GpuSpec,
    tp: usize,
    bw_efficiency: f64,
    per_layer_cpu_overhead_us: f64,
    mfu: MfuDatabase,
}

impl RooflineModel {
    pub fn from_config(config: &RooflineConfig) -> Result<Self, LatencyError> {
        let mfu = MfuDatabase::load(&config.bench_data_path, &config.gpu, &config.model, config.tp)?;
        Self::new(config, mfu)
    }

    /// Construct with an already-loaded database.
    pub fn new(config: &RooflineConfig, mfu: MfuDatabase) -> Result<Self, LatencyError> {
        let model = builtin_model(&config.model)
            .ok_or_else(|| LatencyError::UnknownModel(config.model.clone()))?;
        let gpu = builtin_gpu(&config.gpu)
            .ok_or_else(|| LatencyError::UnknownGpu(config.gpu.clone()))?;
        if config.tp == 0 {
            return Err(LatencyError::ZeroTensorParallel);
        }
        if !(0.0..=1.0).contains(&config.bw_efficiency) || config.bw_efficiency == 0.0 {
            return Err(LatencyError::BadBwEfficiency(config.bw_efficiency));
        }
        Ok(Self {
            model,
            gpu,
            tp: config.tp,
            bw_efficiency: config.bw_efficiency,
            per_layer_cpu_overhead_us: config.per_layer_cpu_overhead_us,
            mfu,
        })
    }

    /// FLOPs for the projections (QKV, output, SwiGLU MLP) per processed
    /// token, across all layers.
    fn linear_flops_per_token(&self) -> f64 {
        let h = self.model.hidden as f64;
        let kv_dim = (self.model.kv_heads * self.model.head_dim) as f64;
        let i = self.model.intermediate as f64;
        // q proj + kv proj + o proj + gate/up/down.
        let per_layer = 2.0 * h * h + 2.0 * h * (2.0 * kv_dim) + 2.0 * h * h + 6.0 * h * i;
        per_layer * self.model.layers as f64
    }

    /// Bytes of weights each step streams through the memory system.
    fn weight_bytes(&self) -> f64 {
        self.model.params * 2.0
    }

    /// Bytes of KV history for `context` tokens.
    fn kv_bytes(&self, context: f64) -> f64 {
        context * (self.model.layers * 2 * self.model.kv_heads * self.model.head_dim * 2) as f64
    }

    fn compute_secs(&self, flops: f64, mfu: f64) -> f64 {
        flops / (self.gpu.peak_flops * self.tp as f64 * mfu.max(MFU_FLOOR))
    }

    fn memory_secs(&self, bytes: f64) -> f64 {
        bytes / (self.gpu.mem_bandwidth * self.tp as f64 * self.bw_efficiency)
    }

    fn cpu_overhead_secs(&self) -> f64 {
        self.model.layers as f64 * self.per_layer_cpu_overhead_us * 1e-6
    }

    fn prefill_secs(&self, features: &BatchFeatures) -> f64 {
        if features.cache_miss_tokens == 0 {
            return 0.0;
        }
        let tokens = features.cache_miss_tokens as f64;
        let chunk = features.max_prefill_tokens.max(1) as f64;
        let h = self.model.hidden as f64;

        let linear = tokens * self.linear_flops_per_token();
        // Causal FlashAttention over the chunk: QK^T and PV.
        let attention = 2.0 * tokens * chunk * h * self.model.layers as f64;

        let gemm_mfu =
            self.mfu
                .gemm_mfu(features.cache_miss_tokens, self.model.hidden, self.model.hidden);
        let mha_mfu = self.mfu.prefill_mfu(features.max_prefill_tokens);

        let compute = self.compute_secs(linear, gemm_mfu) + self.compute_secs(attention, mha_mfu);
        let memory = self.memory_secs(self.weight_bytes() + self.kv_bytes(tokens));
        compute.max(memory) + self.cpu_overhead_secs()
    }

    fn decode_secs(&self, features: &BatchFeatures) -> f64 {
        if features.decode_tokens == 0 {
            return 0.0;
        }
        let tokens = features.decode_tokens as f64;
        let context = features.decode_context_tokens as f64;
        let avg_kv = context / features.num_decode_reqs.max(1) as f64;
        let h = self.model.hidden as f64;

        let linear = tokens * self.linear_flops_per_token();
        let attention = 4.0 * tokens * avg_kv * h * self.model.layers as f64;

        let gemm_mfu =
            self.mfu
                .gemm_mfu(features.num_decode_reqs, self.model.hidden, self.model.hidden);
        let mha_mfu = self
            .mfu
            .decode_mfu(features.num_decode_reqs, avg_kv.round() as usize);

        let compute = self.compute_secs(linear, gemm_mfu) + self.compute_secs(attention, mha_mfu);
        let memory = self.memory_secs(self.weight_bytes() + self.kv_bytes(context));
        compute.max(memory) + self.cpu_overhead_secs()
    }
}

impl LatencyModel for RooflineModel {
    fn step_time(&self, features: &BatchFeatures) -> Tick {
        let secs = self.prefill_secs(features) + self.decode_secs(features);
        (secs * 1e6).round() as Tick
    }

    fn queueing_time(&self, _input_len: usize) -> Tick {
        0
    }

    fn output_token_processing_time(&self) -> Tick {
        0
    }

    fn scheduling_processing_time(&self) -> Tick {
        0
    }

    fn preemption_processing_time(&self) -> Tick {
        0
    }
}
