//! Distribution-based workload generator.
//!
//! Arrival gaps are exponential at the configured rate; prompt and output
//! lengths are normal, clamped to their [min, max] bounds. Every prompt
//! starts with a shared prefix of `prefix_tokens` tokens (drawn once per
//! run), which is what exercises prefix caching under synthetic load. All
//! randomness flows from one seeded ChaCha stream.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};

use crate::config::SyntheticWorkloadConfig;
use crate::core::request::Request;
use crate::workload::{WorkloadError, VOCAB};

/// Generate the full request list for a run.
pub fn generate(config: &SyntheticWorkloadConfig, seed: u64) -> Result<Vec<Request>, WorkloadError> {
    if config.rate <= 0.0 || !config.rate.is_finite() {
        return Err(WorkloadError::BadDistribution(format!(
            "rate must be positive, got {}",
            config.rate
        )));
    }
    let gap_dist = Exp::new(config.rate)
        .map_err(|e| WorkloadError::BadDistribution(format!("rate: {e}")))?;
    let prompt_dist = Normal::new(config.prompt_mean, config.prompt_stddev)
        .map_err(|e| WorkloadError::BadDistribution(format!("prompt length: {e}")))?;
    let output_dist = Normal::new(config.output_mean, config.output_stddev)
        .map_err(|e| WorkloadError::BadDistribution(format!("output length: {e}")))?;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let prefix: Vec<u32> = (0..config.prefix_tokens)
        .map(|_| rng.gen_range(0..VOCAB))
        .collect();

    let mut requests = Vec::with_capacity(config.max_prompts);
    let mut clock = 0u64;

    for i in 0..config.max_prompts {
        let gap_secs = gap_dist.sample(&mut rng);
        clock += (gap_secs * 1e6).round() as u64;

        let prompt_len = sample_len(
            &mut rng,
            &prompt_dist,
            config.prompt_min,
            config.prompt_max,
        );
        let output_len = sample_len(
            &mut rng,
            &output_dist,
            config.output_min,
            config.output_max,
        );

        let mut input = Vec::with_capacity(prompt_len);
        input.extend_from_slice(&prefix[..prefix.len().min(prompt_len)]);
        while input.len() < prompt_len {
            input.push(rng.gen_range(0..VOCAB));
        }
        let output: Vec<u32> = (0..output_len).map(|_| rng.gen_range(0..VOCAB)).collect();

        let mut req = Request::new(i as u64 + 1, input, output);
        req.arrival_time = clock;
        requests.push(req);
    }

    Ok(requests)
}

fn sample_len(
    rng: &mut ChaCha8Rng,
    dist: &Normal<f64>,
    min: usize,
    max: usize,
) -> usize {
    let sample = dist.sample(rng).round();
    (sample.max(0.0) as usize).clamp(min, max.max(min))
}
