//! Block-granular KV cache store with prefix reuse.
//!
//! The store manages a fixed arena of `total_blocks` block slots. A slot is
//! free, live (owned by exactly one request), or retained: released
//! content kept around for prefix hits until LRU eviction reclaims it.
//! Full blocks are addressable through a prefix-hash index, which answers
//! the longest-cached-prefix query during batch formation.
//!
//! With `cpu_blocks` configured, evictions can spill to a slow tier
//! ([`crate::kv::tiered::SlowTier`]) instead of discarding content, and
//! prefix hits against the slow tier pull blocks back at a transfer cost.

use std::collections::{BTreeMap, HashMap, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::config::KvCacheConfig;
use crate::core::request::{RequestId, Tick};
use crate::kv::tiered::SlowTier;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv cache misconfigured: total_blocks must be nonzero")]
    ZeroCapacity,

    #[error("kv cache misconfigured: block_size_tokens must be nonzero")]
    ZeroBlockSize,

    #[error("kv cache misconfigured: offload_threshold {0} outside [0, 1]")]
    BadOffloadThreshold(f64),

    #[error("kv cache misconfigured: transfer_bandwidth must be positive, got {0}")]
    BadBandwidth(f64),
}

/// A cached block found by the longest-prefix query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedBlock {
    /// Retained block resident on the fast tier, by slot position.
    Fast(usize),
    /// Block resident on the slow tier, by prefix hash.
    Slow(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Live(RequestId),
    Retained,
}

#[derive(Debug)]
struct BlockSlot {
    state: SlotState,
    /// Prefix hash of the content, once the covering block is full.
    hash: Option<u64>,
}

/// Allocation and hit counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvCounters {
    /// Blocks handed out, including cache hits.
    pub allocated_blocks: u64,
    /// Blocks satisfied from cache (fast or slow tier).
    pub hit_blocks: u64,
    /// Allocation calls.
    pub requests: u64,
}

/// The per-instance KV cache.
#[derive(Debug)]
pub struct KvStore {
    block_size: usize,
    total_blocks: usize,
    slots: Vec<BlockSlot>,

    free: VecDeque<usize>,
    /// Retained slots by release age, oldest first.
    retained_age: BTreeMap<u64, usize>,
    retained_pos: HashMap<usize, u64>,
    next_age: u64,
    live_count: usize,

    /// Prefix hash -> slot position holding that content.
    index: HashMap<u64, usize>,
    /// Live block positions per request, in block-index order.
    owned: HashMap<RequestId, Vec<usize>>,

    counters: KvCounters,
    offload_threshold: f64,
    slow: Option<SlowTier>,
}

impl KvStore {
    pub fn new(config: &KvCacheConfig) -> Result<Self, KvError> {
        if config.total_blocks == 0 {
            return Err(KvError::ZeroCapacity);
        }
        if config.block_size_tokens == 0 {
            return Err(KvError::ZeroBlockSize);
        }
        if !(0.0..=1.0).contains(&config.offload_threshold) {
            return Err(KvError::BadOffloadThreshold(config.offload_threshold));
        }
        if config.transfer_bandwidth <= 0.0 {
            return Err(KvError::BadBandwidth(config.transfer_bandwidth));
        }

        let slow = config.cpu_blocks.filter(|&n| n > 0).map(|capacity| {
            SlowTier::new(
                capacity,
                config.transfer_bandwidth,
                config.base_latency,
                config.thrashing_window,
            )
        });

        Ok(Self {
            block_size: config.block_size_tokens,
            total_blocks: config.total_blocks,
            slots: (0..config.total_blocks)
                .map(|_| BlockSlot {
                    state: SlotState::Free,
                    hash: None,
                })
                .collect(),
            free: (0..config.total_blocks).collect(),
            retained_age: BTreeMap::new(),
            retained_pos: HashMap::new(),
            next_age: 0,
            live_count: 0,
            index: HashMap::new(),
            owned: HashMap::new(),
            counters: KvCounters::default(),
            offload_threshold: config.offload_threshold,
            slow,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Blocks currently owned by running requests.
    pub fn used_blocks(&self) -> usize {
        self.live_count
    }

    /// Blocks not owned by any request (free-list plus retained pool).
    pub fn free_blocks(&self) -> usize {
        self.total_blocks - self.live_count
    }

    /// Fast-tier utilization in [0, 1], counting live blocks only.
    pub fn utilization(&self) -> f64 {
        self.live_count as f64 / self.total_blocks as f64
    }

    pub fn counters(&self) -> KvCounters {
        self.counters
    }

    /// Fraction of allocated blocks that were served from cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.counters.allocated_blocks == 0 {
            return 0.0;
        }
        self.counters.hit_blocks as f64 / self.counters.allocated_blocks as f64
    }

    pub fn blocks_owned_by(&self, req: RequestId) -> usize {
        self.owned.get(&req).map_or(0, Vec::len)
    }

    /// Longest run of block hashes resident in cache, in order. A fast-tier
    /// retained copy wins over a slow-tier one for the same hash.
    pub fn get_cached_blocks(&self, hashes: &[u64]) -> Vec<CachedBlock> {
        let mut run = Vec::new();
        for &hash in hashes {
            if let Some(&pos) = self.index.get(&hash) {
                if self.slots[pos].state == SlotState::Retained {
                    run.push(CachedBlock::Fast(pos));
                    continue;
                }
            }
            if self.slow.as_ref().is_some_and(|s| s.contains(hash)) {
                run.push(CachedBlock::Slow(hash));
                continue;
            }
            break;
        }
        run
    }

    /// Extend `req`'s block coverage to `end_index` tokens.
    ///
    /// `cached` blocks (from [`Self::get_cached_blocks`]) become live for
    /// the request; the remaining blocks come from the free list, then from
    /// LRU eviction of the retained pool. Fails without mutating anything
    /// if the arena cannot supply enough blocks; the caller preempts and
    /// retries. `hashes` are the request's prefix hashes; newly filled full
    /// blocks are registered in the index.
    pub fn allocate(
        &mut self,
        req: RequestId,
        hashes: &[u64],
        end_index: usize,
        cached: &[CachedBlock],
    ) -> bool {
        self.counters.requests += 1;

        let owned_blocks = self.blocks_owned_by(req);
        let target_blocks = end_index.div_ceil(self.block_size);
        let miss_blocks = target_blocks.saturating_sub(owned_blocks + cached.len());
        let slow_hits = cached
            .iter()
            .filter(|c| matches!(c, CachedBlock::Slow(_)))
            .count();
        let fast_hits = cached.len() - slow_hits;

        // Every miss and every slow-tier reload needs a fast slot; fast
        // hits are retained slots that flip to live in place.
        let slots_needed = miss_blocks + slow_hits;
        let evictable = self.retained_pos.len().saturating_sub(fast_hits);
        if self.free.len() + evictable < slots_needed {
            return false;
        }

        let mut reloaded = Vec::with_capacity(slow_hits);
        for block in cached {
            match *block {
                CachedBlock::Fast(pos) => {
                    let age = self.retained_pos.remove(&pos).expect("hit on non-retained slot");
                    self.retained_age.remove(&age);
                    self.slots[pos].state = SlotState::Live(req);
                    self.live_count += 1;
                    self.owned.entry(req).or_default().push(pos);
                }
                CachedBlock::Slow(hash) => {
                    let pos = self.take_slot();
                    self.slots[pos].state = SlotState::Live(req);
                    self.slots[pos].hash = Some(hash);
                    self.index.insert(hash, pos);
                    self.live_count += 1;
                    self.owned.entry(req).or_default().push(pos);
                    reloaded.push(hash);
                }
            }
        }
        if let Some(slow) = self.slow.as_mut() {
            slow.reload(&reloaded);
        }

        for _ in 0..miss_blocks {
            let pos = self.take_slot();
            self.slots[pos].state = SlotState::Live(req);
            self.slots[pos].hash = None;
            self.live_count += 1;
            self.owned.entry(req).or_default().push(pos);
        }

        // Register hashes for every full block now covered.
        let full_blocks = (end_index / self.block_size).min(hashes.len());
        if let Some(positions) = self.owned.get(&req) {
            for (i, &hash) in hashes.iter().enumerate().take(full_blocks) {
                let pos = positions[i];
                if self.slots[pos].hash.is_none() {
                    self.slots[pos].hash = Some(hash);
                    self.index.insert(hash, pos);
                }
            }
        }

        self.counters.allocated_blocks += (cached.len() + miss_blocks) as u64;
        self.counters.hit_blocks += cached.len() as u64;
        true
    }

    /// Move all of `req`'s live blocks to the retained pool. Index entries
    /// survive so future requests can hit them.
    pub fn release(&mut self, req: RequestId) {
        let Some(positions) = self.owned.remove(&req) else {
            return;
        };
        debug!(request_id = req, blocks = positions.len(), "released kv blocks");
        for pos in positions {
            self.slots[pos].state = SlotState::Retained;
            self.live_count -= 1;
            let age = self.next_age;
            self.next_age += 1;
            self.retained_age.insert(age, pos);
            self.retained_pos.insert(pos, age);
        }
    }

    /// Advance the simulated clock (ages the slow tier's thrashing window).
    pub fn set_clock(&mut self, now: Tick) {
        if let Some(slow) = self.slow.as_mut() {
            slow.set_clock(now);
        }
    }

    pub fn pending_transfer_latency(&self) -> Tick {
        self.slow.as_ref().map_or(0, SlowTier::pending_transfer_latency)
    }

    pub fn consume_pending_transfer_latency(&mut self) -> Tick {
        self.slow
            .as_mut()
            .map_or(0, SlowTier::consume_pending_transfer_latency)
    }

    pub fn thrashing_rate(&self) -> f64 {
        self.slow.as_ref().map_or(0.0, SlowTier::thrashing_rate)
    }

    /// Grab a free slot, evicting the oldest retained block if the free
    /// list is empty. Availability was checked by the caller.
    fn take_slot(&mut self) -> usize {
        if let Some(pos) = self.free.pop_front() {
            return pos;
        }
        let (&age, &pos) = self
            .retained_age
            .iter()
            .next()
            .expect("take_slot called with no free or retained blocks");
        self.retained_age.remove(&age);
        self.retained_pos.remove(&pos);

        if let Some(hash) = self.slots[pos].hash.take() {
            if self.index.get(&hash) == Some(&pos) {
                self.index.remove(&hash);
            }
            // Spill content to the slow tier only under fast-tier pressure.
            if self.utilization() >= self.offload_threshold {
                if let Some(slow) = self.slow.as_mut() {
                    slow.offload(hash);
                }
            }
        }
        pos
    }
}
