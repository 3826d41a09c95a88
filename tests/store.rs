//! Tiered store end-to-end scenarios: cache hit/miss/flush/restart and
//! eviction-preserves-durability (spec.md §8 scenarios 3-4).

use std::sync::Arc;
use std::time::Duration;
use validator_ingress::metrics::Metrics;
use validator_ingress::store::cache::EvictionPolicy;
use validator_ingress::store::durable::DurableTier;
use validator_ingress::store::{Account, TieredStore, TieredStoreConfig};

fn config(dir: &std::path::Path, max_entries: usize) -> TieredStoreConfig {
    TieredStoreConfig {
        durable_dir: dir.to_path_buf(),
        max_entries,
        max_memory: 16 * 1024 * 1024,
        eviction_policy: EvictionPolicy::Adaptive,
        writeback_interval: Duration::from_millis(20),
        integrity_enabled: false,
    }
}

#[test]
fn hit_miss_flush_and_restart_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let key = *b"k1______________________________"; // 32 bytes

    {
        let store = TieredStore::new(config(dir.path(), 16), Arc::new(Metrics::new())).unwrap();

        assert!(store.get(&key).unwrap().is_none());
        assert_eq!(store.stats().cache_misses, 1);

        store
            .put(
                key,
                Account { lamports: 1000, data: vec![0xDE, 0xAD], owner: *b"o1______________________________", executable: false, rent_epoch: 0 },
                100,
            )
            .unwrap();

        let got = store.get(&key).unwrap().unwrap();
        assert_eq!(got.lamports, 1000);
        assert_eq!(store.stats().cache_hits, 1);

        assert_eq!(store.flush().unwrap(), 1);
    }

    // fresh process, same durable directory.
    let store = TieredStore::new(config(dir.path(), 16), Arc::new(Metrics::new())).unwrap();
    let got = store.get(&key).unwrap().unwrap();
    assert_eq!(got.lamports, 1000);
}

#[test]
fn eviction_under_bound_preserves_durability() {
    let dir = tempfile::tempdir().unwrap();
    let store = TieredStore::new(config(dir.path(), 2), Arc::new(Metrics::new())).unwrap();

    let key_a = [1u8; 32];
    let key_b = [2u8; 32];
    let key_c = [3u8; 32];

    store.put(key_a, Account { lamports: 1, data: vec![1], owner: [0; 32], executable: false, rent_epoch: 0 }, 1).unwrap();
    store.put(key_b, Account { lamports: 2, data: vec![2], owner: [0; 32], executable: false, rent_epoch: 0 }, 2).unwrap();
    assert_eq!(store.stats().entries, 2);

    store.put(key_c, Account { lamports: 3, data: vec![3], owner: [0; 32], executable: false, rent_epoch: 0 }, 3).unwrap();
    assert_eq!(store.stats().entries, 2);
    assert_eq!(store.stats().cache_evictions, 1);

    let durable = DurableTier::new(dir.path()).unwrap();
    let evicted_present = durable.read(&key_a).unwrap().is_some() || durable.read(&key_b).unwrap().is_some();
    assert!(evicted_present, "the evicted dirty entry must have been flushed to the durable tier");
}
