//! Router-side prefix cache index.
//!
//! The router cannot see instance KV stores directly; instead it remembers
//! which block hashes it has routed where. Each instance gets a bounded
//! LRU sub-index; `match_length` estimates how much of a prompt an
//! instance is likely to have cached. One index is shared across all SLO
//! profiles of a policy.

use std::collections::{BTreeMap, HashMap};

use crate::core::request::InstanceId;

#[derive(Debug, Default)]
struct InstanceIndex {
    /// Hash -> age of the most recent touch.
    entries: HashMap<u64, u64>,
    /// Age -> hash, oldest first.
    by_age: BTreeMap<u64, u64>,
    next_age: u64,
}

impl InstanceIndex {
    fn touch(&mut self, hash: u64, capacity: usize) {
        if let Some(age) = self.entries.remove(&hash) {
            self.by_age.remove(&age);
        } else if self.entries.len() >= capacity {
            if let Some((&oldest_age, &oldest_hash)) = self.by_age.iter().next() {
                self.by_age.remove(&oldest_age);
                self.entries.remove(&oldest_hash);
            }
        }
        let age = self.next_age;
        self.next_age += 1;
        self.entries.insert(hash, age);
        self.by_age.insert(age, hash);
    }
}

/// Bounded per-instance LRU over routed block hashes.
#[derive(Debug)]
pub struct PrefixAffinityIndex {
    capacity: usize,
    instances: Vec<InstanceIndex>,
}

impl PrefixAffinityIndex {
    pub fn new(instances: usize, capacity: usize) -> Self {
        Self {
            capacity,
            instances: (0..instances).map(|_| InstanceIndex::default()).collect(),
        }
    }

    /// Record a routed request's block hashes against the chosen instance.
    pub fn record(&mut self, instance: InstanceId, hashes: &[u64]) {
        if self.capacity == 0 {
            return;
        }
        let index = &mut self.instances[instance];
        for &hash in hashes {
            index.touch(hash, self.capacity);
        }
    }

    /// Longest prefix of `hashes` present in the instance's sub-index, in
    /// order.
    pub fn match_length(&self, instance: InstanceId, hashes: &[u64]) -> usize {
        let index = &self.instances[instance];
        hashes
            .iter()
            .take_while(|hash| index.entries.contains_key(hash))
            .count()
    }
}
