//! Explicit, dependency-injected counters.
//!
//! No global registry: every component that wants to count something is
//! handed an `Arc<Metrics>` (or a subset view of one) at construction. Tests
//! build their own instance instead of racing over process-wide statics.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub packets_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub rx_dropped: AtomicU64,

    pub gossip_packets: AtomicU64,
    pub shred_packets: AtomicU64,
    pub tx_legacy_packets: AtomicU64,
    pub tx_quic_packets: AtomicU64,
    pub rpc_packets: AtomicU64,
    pub repair_packets: AtomicU64,
    pub vote_packets: AtomicU64,
    pub unknown_packets: AtomicU64,

    pub zero_copy_fallback: AtomicU64,
    pub bypass_active: AtomicU64,

    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub durable_writes: AtomicU64,
    pub durable_write_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

use crate::packet::FlowClass;

impl Metrics {
    /// bump the per-class counter matching `class`.
    pub fn record_class(&self, class: FlowClass) {
        let counter = match class {
            FlowClass::Gossip => &self.gossip_packets,
            FlowClass::Shred => &self.shred_packets,
            FlowClass::TxLegacy => &self.tx_legacy_packets,
            FlowClass::TxQuic => &self.tx_quic_packets,
            FlowClass::Rpc => &self.rpc_packets,
            FlowClass::Repair => &self.repair_packets,
            FlowClass::Vote => &self.vote_packets,
            FlowClass::Unknown => &self.unknown_packets,
        };
        Self::incr(counter);
    }
}
