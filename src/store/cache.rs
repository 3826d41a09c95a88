//! RAM tier: a bounded, mutex-guarded map of 32-byte keys to cache entries
//! with LRU/LFU/Adaptive eviction (spec.md §4.5).

use super::Account;
use ahash::AHashMap;
use std::time::Instant;

pub type Key = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Adaptive,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Adaptive
    }
}

/// spec.md §3 "Cache Entry": an account plus the bookkeeping the eviction
/// policy and writeback thread need.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Key,
    pub account: Account,
    pub write_slot: u64,
    pub access_count: u64,
    pub last_access: Instant,
    pub dirty: bool,
    pub data_hash: Option<[u8; 32]>,
}

impl CacheEntry {
    fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.account.data.len()
    }

    fn score(&self, policy: EvictionPolicy, now: Instant) -> f64 {
        let recency = -(now.duration_since(self.last_access).as_secs_f64());
        let frequency = self.access_count as f64;
        match policy {
            EvictionPolicy::Lru => recency,
            EvictionPolicy::Lfu => frequency,
            EvictionPolicy::Adaptive => 0.7 * recency + 0.3 * frequency,
        }
    }
}

/// a single-mutex RAM cache; all public methods are called with the lock
/// already held by `TieredStore` (spec.md §4.5 concurrency note: `get` holds
/// it briefly to capture a handle, releases before returning).
pub struct RamCache {
    entries: AHashMap<Key, CacheEntry>,
    policy: EvictionPolicy,
    max_entries: usize,
    max_memory: usize,
    memory_used: usize,
}

pub enum Eviction {
    Clean(CacheEntry),
    Dirty(CacheEntry),
}

impl RamCache {
    pub fn new(policy: EvictionPolicy, max_entries: usize, max_memory: usize) -> Self {
        Self {
            entries: AHashMap::new(),
            policy,
            max_entries,
            max_memory,
            memory_used: 0,
        }
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.memory_used = self.memory_used.saturating_sub(entry.approx_size());
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// insert `entry`, evicting lowest-scored entries first until both
    /// bounds are satisfied. Returns the evicted entries so the caller (the
    /// `TieredStore`, holding the durable tier) can flush dirty ones.
    pub fn insert(&mut self, entry: CacheEntry) -> Vec<Eviction> {
        let incoming_size = entry.approx_size();
        let mut evicted = Vec::new();

        if let Some(old) = self.entries.remove(&entry.key) {
            self.memory_used = self.memory_used.saturating_sub(old.approx_size());
        }

        while (self.entries.len() >= self.max_entries && !self.entries.is_empty())
            || (self.memory_used + incoming_size > self.max_memory && !self.entries.is_empty())
        {
            let Some(victim_key) = self.select_victim() else { break };
            let victim = self.entries.remove(&victim_key).expect("victim key came from entries");
            self.memory_used = self.memory_used.saturating_sub(victim.approx_size());
            evicted.push(if victim.dirty { Eviction::Dirty(victim) } else { Eviction::Clean(victim) });
        }

        self.memory_used += incoming_size;
        self.entries.insert(entry.key, entry);
        evicted
    }

    fn select_victim(&self) -> Option<Key> {
        let now = Instant::now();
        let mut best: Option<(Key, f64, Instant)> = None;
        for (key, entry) in &self.entries {
            let score = entry.score(self.policy, now);
            match &best {
                None => best = Some((*key, score, entry.last_access)),
                Some((_, best_score, best_last_access)) => {
                    if score < *best_score || (score == *best_score && entry.last_access < *best_last_access) {
                        best = Some((*key, score, entry.last_access));
                    }
                }
            }
        }
        best.map(|(key, _, _)| key)
    }

    pub fn iter_dirty(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values().filter(|e| e.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: Key, access_count: u64, dirty: bool) -> CacheEntry {
        CacheEntry {
            key,
            account: Account { lamports: 1, data: vec![0; 8], owner: [0; 32], executable: false, rent_epoch: 0 },
            write_slot: 0,
            access_count,
            last_access: Instant::now(),
            dirty,
            data_hash: None,
        }
    }

    #[test]
    fn evicts_lowest_frequency_under_lfu() {
        let mut cache = RamCache::new(EvictionPolicy::Lfu, 2, usize::MAX);
        cache.insert(entry([1; 32], 10, false));
        cache.insert(entry([2; 32], 1, false));
        let evicted = cache.insert(entry([3; 32], 5, false));
        assert_eq!(evicted.len(), 1);
        match &evicted[0] {
            Eviction::Clean(e) => assert_eq!(e.key, [2; 32]),
            Eviction::Dirty(_) => panic!("expected clean eviction"),
        }
        assert!(cache.contains(&[1; 32]));
        assert!(cache.contains(&[3; 32]));
    }

    #[test]
    fn dirty_eviction_is_reported_for_synchronous_flush() {
        let mut cache = RamCache::new(EvictionPolicy::Lru, 1, usize::MAX);
        cache.insert(entry([1; 32], 1, true));
        let evicted = cache.insert(entry([2; 32], 1, false));
        assert_eq!(evicted.len(), 1);
        assert!(matches!(evicted[0], Eviction::Dirty(_)));
    }
}
