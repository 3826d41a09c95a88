//! Tiered Hot Store (C5, spec.md §4.5): RAM cache in front of a durable,
//! one-file-per-key tier, with asynchronous writeback and a synchronous
//! `flush()` escape hatch.

pub mod cache;
pub mod durable;
pub mod writeback;

use crate::error::Result;
use crate::metrics::Metrics;
use cache::{CacheEntry, Eviction, EvictionPolicy, Key, RamCache};
use durable::DurableTier;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// the value type stored in both tiers (spec.md §3's Cache Entry minus the
/// bookkeeping fields `cache::CacheEntry` adds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub lamports: u64,
    pub data: Vec<u8>,
    pub owner: [u8; 32],
    pub executable: bool,
    pub rent_epoch: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub durable_writes: u64,
    pub durable_write_failures: u64,
}

pub struct TieredStoreConfig {
    pub durable_dir: PathBuf,
    pub max_entries: usize,
    pub max_memory: usize,
    pub eviction_policy: EvictionPolicy,
    pub writeback_interval: Duration,
    pub integrity_enabled: bool,
}

impl Default for TieredStoreConfig {
    fn default() -> Self {
        Self {
            durable_dir: PathBuf::from("./store"),
            max_entries: 100_000,
            max_memory: 512 * 1024 * 1024,
            eviction_policy: EvictionPolicy::default(),
            writeback_interval: Duration::from_millis(100),
            integrity_enabled: false,
        }
    }
}

pub struct TieredStore {
    cache: Arc<Mutex<RamCache>>,
    durable: Arc<DurableTier>,
    writeback_queue: writeback::WritebackQueue,
    writeback_stop: Arc<AtomicBool>,
    writeback_handle: Option<JoinHandle<()>>,
    metrics: Arc<Metrics>,
    integrity_enabled: bool,
}

impl TieredStore {
    pub fn new(config: TieredStoreConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let durable = Arc::new(DurableTier::new(config.durable_dir)?);
        let cache = Arc::new(Mutex::new(RamCache::new(
            config.eviction_policy,
            config.max_entries,
            config.max_memory,
        )));

        let drain_cache = Arc::clone(&cache);
        let drain_durable = Arc::clone(&durable);
        let drain_metrics = Arc::clone(&metrics);
        let (writeback_queue, writeback_stop, writeback_handle) =
            writeback::spawn(config.writeback_interval, move |keys: &[Key]| {
                drain_batch(&drain_cache, &drain_durable, &drain_metrics, keys);
            });

        Ok(Self {
            cache,
            durable,
            writeback_queue,
            writeback_stop,
            writeback_handle: Some(writeback_handle),
            metrics,
            integrity_enabled: config.integrity_enabled,
        })
    }

    pub fn get(&self, key: &Key) -> Result<Option<Account>> {
        {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            if let Some(entry) = cache.get_mut(key) {
                entry.access_count += 1;
                entry.last_access = Instant::now();
                let account = entry.account.clone();
                drop(cache);
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(account));
            }
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        let Some(account) = self.durable.read(key)? else {
            return Ok(None);
        };

        let entry = CacheEntry {
            key: *key,
            account: account.clone(),
            write_slot: 0,
            access_count: 1,
            last_access: Instant::now(),
            dirty: false,
            data_hash: self.integrity_enabled.then(|| hash_of(&account.data)),
        };
        self.insert_with_eviction(entry)?;
        Ok(Some(account))
    }

    pub fn put(&self, key: Key, account: Account, slot: u64) -> Result<()> {
        let entry = CacheEntry {
            key,
            data_hash: self.integrity_enabled.then(|| hash_of(&account.data)),
            account,
            write_slot: slot,
            access_count: 1,
            last_access: Instant::now(),
            dirty: true,
        };
        self.insert_with_eviction(entry)?;
        self.writeback_queue.enqueue(key);
        Ok(())
    }

    fn insert_with_eviction(&self, entry: CacheEntry) -> Result<()> {
        let evictions = {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            cache.insert(entry)
        };
        for eviction in evictions {
            self.metrics.cache_evictions.fetch_add(1, Ordering::Relaxed);
            if let Eviction::Dirty(dirty_entry) = eviction {
                self.write_through(&dirty_entry)?;
            }
        }
        Ok(())
    }

    fn write_through(&self, entry: &CacheEntry) -> Result<()> {
        write_through_to(&self.durable, &self.metrics, entry)
    }

    /// synchronously flush every dirty entry currently in RAM, returning
    /// the count written. The only operation that guarantees on return
    /// that all queued writes are durable (spec.md §4.5).
    pub fn flush(&self) -> Result<usize> {
        let dirty: Vec<CacheEntry> = {
            let cache = self.cache.lock().expect("cache mutex poisoned");
            cache.iter_dirty().cloned().collect()
        };
        let mut written = 0;
        for entry in &dirty {
            self.write_through(entry)?;
            written += 1;
        }
        {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            for entry in &dirty {
                if let Some(live) = cache.get_mut(&entry.key) {
                    if live.write_slot == entry.write_slot {
                        live.dirty = false;
                    }
                }
            }
        }
        Ok(written)
    }

    pub fn remove(&self, key: &Key) -> bool {
        let removed_from_ram = {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            cache.remove(key).is_some()
        };
        let path = self.durable.dir().join(hex_key(key));
        let removed_from_durable = std::fs::remove_file(path).is_ok();
        removed_from_ram || removed_from_durable
    }

    pub fn stats(&self) -> Stats {
        let entries = self.cache.lock().expect("cache mutex poisoned").len();
        Stats {
            entries,
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.metrics.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.metrics.cache_evictions.load(Ordering::Relaxed),
            durable_writes: self.metrics.durable_writes.load(Ordering::Relaxed),
            durable_write_failures: self.metrics.durable_write_failures.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&mut self) {
        self.writeback_stop.store(true, Ordering::Release);
        if let Some(handle) = self.writeback_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TieredStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// drain a batch of keys on the writeback thread: read each entry's current
/// contents under the cache mutex, release it before the durable I/O
/// (spec.md §4.5 concurrency note), then clear the dirty bit only if the
/// entry hasn't been superseded by a newer write in the meantime.
fn drain_batch(cache: &Mutex<RamCache>, durable: &DurableTier, metrics: &Metrics, keys: &[Key]) {
    for key in keys {
        let snapshot = {
            let mut guard = cache.lock().expect("cache mutex poisoned");
            match guard.get_mut(key) {
                Some(entry) if entry.dirty => Some((entry.clone(), entry.write_slot)),
                _ => None,
            }
        };
        let Some((entry, write_slot)) = snapshot else { continue };
        if write_through_to(durable, metrics, &entry).is_err() {
            continue;
        }
        let mut guard = cache.lock().expect("cache mutex poisoned");
        if let Some(live) = guard.get_mut(key) {
            if live.write_slot == write_slot {
                live.dirty = false;
            }
        }
    }
}

fn write_through_to(durable: &DurableTier, metrics: &Metrics, entry: &CacheEntry) -> Result<()> {
    match durable.write(&entry.key, &entry.account) {
        Ok(()) => {
            metrics.durable_writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            metrics.durable_write_failures.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

fn hash_of(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hex_key(key: &Key) -> String {
    let mut s = String::with_capacity(64);
    for b in key {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    fn config(dir: &std::path::Path) -> TieredStoreConfig {
        TieredStoreConfig {
            durable_dir: dir.to_path_buf(),
            max_entries: 16,
            max_memory: 1024 * 1024,
            eviction_policy: EvictionPolicy::Adaptive,
            writeback_interval: Duration::from_millis(20),
            integrity_enabled: false,
        }
    }

    fn account(lamports: u64, data: Vec<u8>) -> Account {
        Account { lamports, data, owner: [1u8; 32], executable: false, rent_epoch: 0 }
    }

    #[test]
    fn get_miss_then_put_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::new(config(dir.path()), metrics()).unwrap();
        let key = [0xAA; 32];

        assert!(store.get(&key).unwrap().is_none());
        store.put(key, account(1000, vec![0xDE, 0xAD]), 100).unwrap();
        let got = store.get(&key).unwrap().unwrap();
        assert_eq!(got.lamports, 1000);

        let stats = store.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn flush_writes_dirty_entries_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key = [0x11; 32];
        {
            let store = TieredStore::new(config(dir.path()), metrics()).unwrap();
            store.put(key, account(1000, vec![0xDE, 0xAD]), 100).unwrap();
            assert_eq!(store.flush().unwrap(), 1);
        }
        let store = TieredStore::new(config(dir.path()), metrics()).unwrap();
        let got = store.get(&key).unwrap().unwrap();
        assert_eq!(got.lamports, 1000);
    }

    #[test]
    fn eviction_preserves_durability_for_dirty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_entries = 1;
        let store = TieredStore::new(cfg, metrics()).unwrap();

        store.put([1u8; 32], account(1, vec![1]), 1).unwrap();
        store.put([2u8; 32], account(2, vec![2]), 2).unwrap();

        let durable = DurableTier::new(dir.path()).unwrap();
        assert!(durable.read(&[1u8; 32]).unwrap().is_some());
    }
}
