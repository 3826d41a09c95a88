//! Configuration record handed to the core by the outer CLI/config layer
//! (spec.md §6). No argument parsing lives in this crate.

use crate::packet::FlowClass;
use crate::program::AttachMode;
use crate::store::cache::EvictionPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(remote = "AttachMode", rename_all = "lowercase")]
enum AttachModeDef {
    Driver,
    Skb,
    Hardware,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(remote = "EvictionPolicy", rename_all = "lowercase")]
enum EvictionPolicyDef {
    Lru,
    Lfu,
    Adaptive,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowClassDef {
    Gossip,
    Shred,
    TxLegacy,
    TxQuic,
    Rpc,
    Repair,
    Vote,
}

impl From<FlowClassDef> for FlowClass {
    fn from(value: FlowClassDef) -> Self {
        match value {
            FlowClassDef::Gossip => FlowClass::Gossip,
            FlowClassDef::Shred => FlowClass::Shred,
            FlowClassDef::TxLegacy => FlowClass::TxLegacy,
            FlowClassDef::TxQuic => FlowClass::TxQuic,
            FlowClassDef::Rpc => FlowClass::Rpc,
            FlowClassDef::Repair => FlowClass::Repair,
            FlowClassDef::Vote => FlowClass::Vote,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub class: FlowClassDef,
}

fn default_worker_threads() -> usize {
    4
}

fn default_rx_ring_size() -> u32 {
    2048
}

fn default_tx_ring_size() -> u32 {
    2048
}

fn default_zero_copy() -> bool {
    true
}

fn default_max_entries() -> usize {
    100_000
}

fn default_max_memory() -> usize {
    512 * 1024 * 1024
}

fn default_writeback_interval_ms() -> u64 {
    100
}

fn default_writeback_batch_cap() -> usize {
    64
}

/// deserialized from the project's TOML config file; mirrors the shape of
/// `store::TieredStoreConfig` and the socket/program setup parameters
/// without depending on their module types directly (kept decoupled so the
/// config layer can be parsed before AF_XDP types are in scope).
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    pub interface: String,
    pub ports: Vec<PortEntry>,

    #[serde(with = "AttachModeDef")]
    pub attach_mode: AttachMode,

    #[serde(default = "default_zero_copy")]
    pub zero_copy: bool,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "default_rx_ring_size")]
    pub rx_ring_size: u32,
    #[serde(default = "default_tx_ring_size")]
    pub tx_ring_size: u32,

    #[serde(default = "default_max_memory")]
    pub cache_max_memory: usize,
    #[serde(default = "default_max_entries")]
    pub cache_max_entries: usize,
    #[serde(with = "EvictionPolicyDef", default)]
    pub eviction_policy: EvictionPolicy,

    pub durable_dir: PathBuf,
    #[serde(default = "default_writeback_interval_ms")]
    pub writeback_interval_ms: u64,
    #[serde(default = "default_writeback_batch_cap")]
    pub writeback_batch_cap: usize,
    #[serde(default)]
    pub integrity_enabled: bool,
}

impl IngressConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn writeback_interval(&self) -> Duration {
        Duration::from_millis(self.writeback_interval_ms)
    }

    pub fn port_map(&self) -> crate::packet::PortMap {
        crate::packet::PortMap::new(
            self.ports
                .iter()
                .map(|entry| (entry.port, entry.class.clone().into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_src = r#"
            interface = "eth0"
            attach_mode = "driver"
            durable_dir = "/tmp/validator-ingress-store"

            [[ports]]
            port = 8001
            class = "gossip"

            [[ports]]
            port = 8899
            class = "rpc"
        "#;
        let config = IngressConfig::from_toml_str(toml_src).unwrap();
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.rx_ring_size, 2048);
        assert!(config.zero_copy);
        assert_eq!(config.ports.len(), 2);

        let port_map = config.port_map();
        assert_eq!(port_map.classify(8001), FlowClass::Gossip);
        assert_eq!(port_map.classify(8899), FlowClass::Rpc);
    }
}
