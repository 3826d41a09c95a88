//! Kernel-bypass ingress datapath for a validator node: an AF_XDP socket
//! layer (C2) behind a shared XDP filter program (C3), feeding a classifying
//! worker pool (C4) backed by a tiered hot store (C5).

mod bpf_sys;
pub mod bytecode;
pub mod config;
pub mod cpu;
pub mod device;
pub mod error;
pub mod metrics;
pub mod netlink;
pub mod packet;
pub mod processor;
pub mod program;
pub mod route;
pub mod socket;
pub mod store;
pub mod umem;

pub use cpu::{get_cpu, set_cpu_affinity};
pub use error::{IngressError, Result};
pub use metrics::Metrics;
