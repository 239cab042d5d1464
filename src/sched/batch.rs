//! Batch formation: builds the next running batch under KV, token, and
//! request budgets.
//!
//! Continuing requests are served first (chunked prefill continuation or
//! one decode slot each), then new requests are dequeued head-first until
//! a budget runs out or an allocation fails. Allocation failures trigger
//! tail preemption: the newest request in the running batch is evicted
//! back to the front of the wait queue and its blocks released, repeatedly
//! until the allocation fits or the batch is empty. Once any preemption
//! happens in a step, no further new requests are dequeued.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::core::queue::WaitQueue;
use crate::core::request::{Batch, RequestId, RequestState, RequestTable, SloClass, Tick};
use crate::kv::store::KvStore;
use crate::latency::LatencyModel;

/// Block hashes of each request's prompt, precomputed on arrival.
pub type PrefixHashes = HashMap<RequestId, Vec<u64>>;

/// Outcome of one batch-formation pass.
#[derive(Debug, Default)]
pub struct FormBatchResult {
    /// The new running batch, in scheduling order.
    pub batch: Batch,

    /// Requests admitted this step, with their scheduling delay.
    pub newly_scheduled: Vec<(RequestId, Tick)>,

    /// Requests tail-evicted this step, with their preemption delay.
    pub preempted: Vec<(RequestId, Tick)>,

    pub preemption_happened: bool,

    /// Requests dropped as unservable (larger than the whole cache).
    pub dropped: Vec<RequestId>,
}

/// Chunked-prefill threshold for a request class. Critical requests can
/// run with smaller chunks, batch-tier requests with larger ones.
fn prefill_threshold(config: &BatchConfig, class: SloClass) -> usize {
    match class {
        SloClass::Critical => config
            .critical_prefill_token_threshold
            .unwrap_or(config.long_prefill_token_threshold),
        SloClass::Sheddable | SloClass::Batch | SloClass::Background => config
            .relaxed_prefill_token_threshold
            .unwrap_or(config.long_prefill_token_threshold),
        _ => config.long_prefill_token_threshold,
    }
}

/// Evict one request from the running batch, restoring it to the front of
/// the wait queue with all progress discarded.
#[allow(clippy::too_many_arguments)]
fn preempt(
    victim: RequestId,
    table: &mut RequestTable,
    kv: &mut KvStore,
    computed_tokens: &mut HashMap<RequestId, usize>,
    wait_queue: &mut WaitQueue,
    latency: &dyn LatencyModel,
    result: &mut FormBatchResult,
) {
    let req = table.get_mut(victim);
    req.state = RequestState::Queued;
    req.progress_index = 0;
    req.num_new_tokens = 0;
    req.preemption_count += 1;

    kv.release(victim);
    computed_tokens.remove(&victim);
    wait_queue.prepend(victim);
    result
        .preempted
        .push((victim, latency.preemption_processing_time()));
    result.preemption_happened = true;
    debug!(request_id = victim, "preempted request (tail eviction)");
}

/// Form the next running batch.
///
/// `previous_batch` is scanned in order; entries evicted by an earlier
/// continuing request's preemption are skipped rather than processed as
/// ghosts. Victims always come from the tail of the live batch: the
/// not-yet-processed remainder first, then the request whose allocation
/// triggered the preemption (which counts as self-eviction), and during
/// the dequeue phase the newest admitted requests.
#[allow(clippy::too_many_arguments)]
pub fn form_batch(
    config: &BatchConfig,
    previous_batch: &Batch,
    wait_queue: &mut WaitQueue,
    kv: &mut KvStore,
    table: &mut RequestTable,
    computed_tokens: &mut HashMap<RequestId, usize>,
    prefix_hashes: &PrefixHashes,
    latency: &dyn LatencyModel,
    now: Tick,
) -> FormBatchResult {
    let mut result = FormBatchResult::default();
    let mut budget = config.max_scheduled_tokens;
    let mut batch: Batch = Vec::with_capacity(previous_batch.len());
    // Tail-eviction marks; marked entries are skipped when the scan
    // reaches them.
    let mut evicted: Vec<RequestId> = Vec::new();

    // Continuing requests, in batch order.
    for (pos, &id) in previous_batch.iter().enumerate() {
        if evicted.contains(&id) {
            continue;
        }

        let req = table.get(id);
        let empty_hashes = Vec::new();
        let hashes = prefix_hashes.get(&id).unwrap_or(&empty_hashes);

        if req.in_prefill() {
            let remaining = req.input_len() - req.progress_index;
            let threshold = prefill_threshold(config, req.slo_class);
            let mut num_new = remaining.min(budget);
            if threshold > 0 {
                num_new = num_new.min(threshold);
            }
            if num_new == 0 {
                // Budget exhausted: the request stays resident but computes
                // nothing this step.
                table.get_mut(id).num_new_tokens = 0;
                batch.push(id);
                continue;
            }

            let end = req.progress_index + num_new;
            if allocate_with_preemption(
                id,
                hashes,
                end,
                &[],
                previous_batch,
                pos,
                &mut evicted,
                table,
                kv,
                computed_tokens,
                wait_queue,
                latency,
                &mut result,
            ) {
                budget -= num_new;
                table.get_mut(id).num_new_tokens = num_new;
                *computed_tokens.entry(id).or_insert(0) += num_new;
                batch.push(id);
            }
            // Allocation failure with self-eviction: the request is back
            // in the wait queue; nothing more to do for it this step.
        } else {
            // Decode: one token, one (possible) block extension.
            if budget == 0 {
                table.get_mut(id).num_new_tokens = 0;
                batch.push(id);
                continue;
            }
            let end = req.progress_index + 1;
            if allocate_with_preemption(
                id,
                hashes,
                end,
                &[],
                previous_batch,
                pos,
                &mut evicted,
                table,
                kv,
                computed_tokens,
                wait_queue,
                latency,
                &mut result,
            ) {
                budget -= 1;
                table.get_mut(id).num_new_tokens = 1;
                *computed_tokens.entry(id).or_insert(0) += 1;
                batch.push(id);
            }
        }
    }

    // Dequeue new requests. Stops on a full batch, an empty queue, an
    // exhausted budget, or any preemption this step. A preemption during a
    // continuing request blocks the whole dequeue phase; a preemption
    // triggered by a candidate still admits that candidate but nothing
    // after it.
    let preempted_in_continuing = result.preemption_happened;
    while !preempted_in_continuing {
        if batch.len() >= config.max_running_reqs || budget == 0 {
            break;
        }
        let Some(id) = wait_queue.peek() else {
            break;
        };

        let req = table.get(id);
        let block_size = kv.block_size();

        // A request that cannot fit even in an empty cache is unservable:
        // drop it (loudly) instead of blocking the queue forever.
        if req.peak_kv_blocks(block_size) > kv.total_blocks() {
            warn!(
                request_id = id,
                tick = now,
                peak_blocks = req.peak_kv_blocks(block_size),
                total_blocks = kv.total_blocks(),
                "dropping unservable request: larger than total kv capacity"
            );
            wait_queue.dequeue();
            table.get_mut(id).state = RequestState::Dropped;
            result.dropped.push(id);
            continue;
        }

        let empty_hashes = Vec::new();
        let hashes = prefix_hashes.get(&id).unwrap_or(&empty_hashes);
        let cached = kv.get_cached_blocks(hashes);
        let start = (cached.len() * block_size).min(req.input_len());
        let remaining = req.input_len() - start;

        let threshold = prefill_threshold(config, req.slo_class);
        if threshold == 0 && remaining > config.max_scheduled_tokens {
            // Without chunking even a full budget cannot cover this
            // prompt; it would block the queue head forever.
            warn!(
                request_id = id,
                tick = now,
                remaining,
                budget = config.max_scheduled_tokens,
                "dropping unservable request: prompt exceeds step token budget"
            );
            wait_queue.dequeue();
            table.get_mut(id).state = RequestState::Dropped;
            result.dropped.push(id);
            continue;
        }
        let mut num_new = remaining.min(budget);
        if threshold > 0 {
            num_new = num_new.min(threshold);
        } else if num_new < remaining {
            // Chunking disabled: the whole prompt must fit in what is left
            // of this step's budget.
            break;
        }
        // A fully cached prompt schedules with zero new tokens; its
        // progress jumps to the prefill boundary when the step executes.

        let end = start + num_new;
        wait_queue.dequeue();

        if !kv.allocate(id, hashes, end, &cached) {
            // Make room by evicting the newest running requests.
            let mut satisfied = false;
            while let Some(&victim) = batch.last() {
                batch.pop();
                preempt(
                    victim,
                    table,
                    kv,
                    computed_tokens,
                    wait_queue,
                    latency,
                    &mut result,
                );
                if kv.allocate(id, hashes, end, &cached) {
                    satisfied = true;
                    break;
                }
            }
            if !satisfied {
                warn!(
                    request_id = id,
                    tick = now,
                    "dropping unservable request: allocation failed with empty batch"
                );
                table.get_mut(id).state = RequestState::Dropped;
                result.dropped.push(id);
                if result.preemption_happened {
                    break;
                }
                continue;
            }
        }

        let req = table.get_mut(id);
        req.state = RequestState::Running;
        req.num_new_tokens = num_new;
        computed_tokens.insert(id, end);
        budget -= num_new;
        batch.push(id);
        result
            .newly_scheduled
            .push((id, latency.scheduling_processing_time()));
        if result.preemption_happened {
            break;
        }
    }

    result.batch = batch;
    debug_assert!(
        total_new_tokens(&result.batch, table) <= config.max_scheduled_tokens,
        "token budget exceeded"
    );
    result
}

/// Allocate for a continuing request, tail-preempting on failure.
///
/// Returns true when the allocation succeeded and the request stays in
/// the batch; false when the request evicted itself (it is back in the
/// wait queue).
#[allow(clippy::too_many_arguments)]
fn allocate_with_preemption(
    id: RequestId,
    hashes: &[u64],
    end: usize,
    cached: &[crate::kv::store::CachedBlock],
    previous_batch: &Batch,
    pos: usize,
    evicted: &mut Vec<RequestId>,
    table: &mut RequestTable,
    kv: &mut KvStore,
    computed_tokens: &mut HashMap<RequestId, usize>,
    wait_queue: &mut WaitQueue,
    latency: &dyn LatencyModel,
    result: &mut FormBatchResult,
) -> bool {
    loop {
        if kv.allocate(id, hashes, end, cached) {
            return true;
        }

        // Victim search walks the live batch from its tail: unprocessed
        // continuing requests first, then the current request itself.
        let victim = previous_batch[pos + 1..]
            .iter()
            .rev()
            .copied()
            .find(|candidate| !evicted.contains(candidate));

        match victim {
            Some(victim) => {
                evicted.push(victim);
                preempt(victim, table, kv, computed_tokens, wait_queue, latency, result);
            }
            None => {
                // Only the current request is left to evict. Give up on it
                // this step; it retries from the queue front.
                preempt(id, table, kv, computed_tokens, wait_queue, latency, result);
                return false;
            }
        }
    }
}

fn total_new_tokens(batch: &Batch, table: &RequestTable) -> usize {
    batch.iter().map(|&id| table.get(id).num_new_tokens).sum()
}
