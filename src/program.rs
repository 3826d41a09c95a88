//! Shared XDP program lifecycle (C3): load or open the filter program,
//! attach it to an interface, and register sockets into its redirect map.
//!
//! Two mutually exclusive program sources are supported (spec.md §9 open
//! question, resolved in DESIGN.md): `Generated`, which builds the program
//! at runtime via [`crate::bytecode::build_redirect_program`] and loads it
//! with raw `bpf(2)` syscalls (`bpf_sys`), and `Pinned`, which opens a
//! program and its redirect map already pinned under
//! `/sys/fs/bpf/<project>/` by an external loader. Both paths attach via
//! `BPF_LINK_CREATE`, so attach/detach is uniform regardless of source.

use crate::bpf_sys;
use crate::error::{IngressError, Result};
use crate::metrics::Metrics;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const REDIRECT_MAP_CAPACITY: u32 = 64;
const PORT_FILTER_CAPACITY: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    Driver,
    Skb,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSource {
    /// build the filter program at init time, from `ports`.
    Generated,
    /// open a program and map an external loader has already pinned.
    Pinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

struct Loaded {
    prog_fd: OwnedFd,
    redirect_map_fd: OwnedFd,
    link_fd: Option<OwnedFd>,
}

/// owns the loaded/attached XDP program and its redirect-target map, keyed
/// by queue index and holding AF_XDP socket fds (spec.md §4.3).
pub struct SharedProgramManager {
    loaded: Mutex<Loaded>,
    if_index: u32,
    interface: String,
    attached: AtomicBool,
    next_queue: AtomicU64,
    registered: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SharedProgramManager {
    /// load (or open) the filter program for `interface`. `attach_mode` is
    /// accepted for parity with the pinned-loader contract but does not
    /// change `BPF_LINK_CREATE`-based attach, which the kernel always
    /// performs in driver mode when the driver supports it and falls back
    /// to generic (skb) mode otherwise; `Hardware` is rejected here as this
    /// crate does not drive offload-capable NICs.
    pub fn init(
        interface: &str,
        if_index: u32,
        ports: &[u16],
        attach_mode: AttachMode,
        source: ProgramSource,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if attach_mode == AttachMode::Hardware {
            return Err(IngressError::InitializationFailure {
                interface: interface.to_string(),
                reason: "hardware offload attach mode is not supported".into(),
            });
        }

        let loaded = match source {
            ProgramSource::Generated => Self::load_generated(interface, ports)?,
            ProgramSource::Pinned => Self::load_pinned(interface)?,
        };

        log::info!("loaded xdp program for {interface} (source={source:?}, ports={})", ports.len());

        Ok(Self {
            loaded: Mutex::new(loaded),
            if_index,
            interface: interface.to_string(),
            attached: AtomicBool::new(false),
            next_queue: AtomicU64::new(0),
            registered: AtomicU64::new(0),
            metrics,
        })
    }

    fn load_generated(interface: &str, ports: &[u16]) -> Result<Loaded> {
        let redirect_map_fd = bpf_sys::create_map(
            "xsks_map",
            bpf_sys::BPF_MAP_TYPE_XSKMAP,
            4,
            4,
            REDIRECT_MAP_CAPACITY,
        )
        .map_err(|e| IngressError::InitializationFailure {
            interface: interface.to_string(),
            reason: format!("xsks_map create failed: {e}"),
        })?;

        // port_filter: BPF_MAP_TYPE_HASH<u16, u8>, seeded {port: 1} for every
        // listen port. The generated program looks a packet's destination
        // port up in this map and only redirects on a hit.
        let port_filter_map_fd = bpf_sys::create_map(
            "port_filter",
            bpf_sys::BPF_MAP_TYPE_HASH,
            2,
            1,
            PORT_FILTER_CAPACITY,
        )
        .map_err(|e| IngressError::InitializationFailure {
            interface: interface.to_string(),
            reason: format!("port_filter create failed: {e}"),
        })?;
        for &port in ports {
            bpf_sys::map_update_elem(&port_filter_map_fd, &port.to_ne_bytes(), &[1u8]).map_err(|e| {
                IngressError::InitializationFailure {
                    interface: interface.to_string(),
                    reason: format!("port_filter insert failed for port {port}: {e}"),
                }
            })?;
        }

        // the pseudo-map-fd immediates below are resolved by the verifier
        // from this process's fd table at BPF_PROG_LOAD time, so neither map
        // fd needs to outlive this function.
        let bytecode = crate::bytecode::build_redirect_program(
            port_filter_map_fd.as_raw_fd(),
            redirect_map_fd.as_raw_fd(),
        )?;

        let prog_fd = bpf_sys::load_xdp_prog("xdp_redirect", &bytecode).map_err(|log| {
            IngressError::VerifierRejection { log }
        })?;

        Ok(Loaded { prog_fd, redirect_map_fd, link_fd: None })
    }

    fn load_pinned(interface: &str) -> Result<Loaded> {
        let pin_dir = format!("/sys/fs/bpf/validator-ingress/{interface}");
        let prog_fd = bpf_sys::obj_get(&format!("{pin_dir}/prog")).map_err(|e| IngressError::InitializationFailure {
            interface: interface.to_string(),
            reason: format!("pinned program open failed: {e}"),
        })?;
        let redirect_map_fd =
            bpf_sys::obj_get(&format!("{pin_dir}/xsks_map")).map_err(|e| IngressError::InitializationFailure {
                interface: interface.to_string(),
                reason: format!("pinned xsks_map open failed: {e}"),
            })?;
        Ok(Loaded { prog_fd, redirect_map_fd, link_fd: None })
    }

    /// attach the loaded program to the interface. Idempotent: a second
    /// call observes the latch and returns immediately.
    pub fn attach(&self) -> Result<()> {
        if self.attached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut loaded = self.loaded.lock().expect("program mutex poisoned");
        let link_fd = bpf_sys::attach_xdp_link(&loaded.prog_fd, self.if_index).map_err(|e| {
            IngressError::InitializationFailure {
                interface: self.interface.clone(),
                reason: format!("BPF_LINK_CREATE failed: {e}"),
            }
        })?;
        loaded.link_fd = Some(link_fd);
        log::info!("xdp program attached to {}", self.interface);
        Ok(())
    }

    /// detach the program by dropping its link fd. Idempotent.
    pub fn detach(&self) {
        if !self.attached.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut loaded = self.loaded.lock().expect("program mutex poisoned");
        loaded.link_fd = None; // Drop closes the link fd, detaching.
        log::info!("xdp program detached from {}", self.interface);
    }

    /// claim the next free redirect-map slot for a newly opened AF_XDP
    /// socket, inserting its fd so XDP_REDIRECT can target it.
    pub fn register(&self, socket_fd: RawFd) -> Result<QueueId> {
        let slot = self.next_queue.fetch_add(1, Ordering::AcqRel);
        if slot as u32 >= REDIRECT_MAP_CAPACITY {
            self.next_queue.fetch_sub(1, Ordering::AcqRel);
            return Err(IngressError::RegisterTargetFull {
                capacity: REDIRECT_MAP_CAPACITY as usize,
                queue_id: slot,
            });
        }
        let loaded = self.loaded.lock().expect("program mutex poisoned");
        let key = (slot as u32).to_ne_bytes();
        let value = (socket_fd as u32).to_ne_bytes();
        bpf_sys::map_update_elem(&loaded.redirect_map_fd, &key, &value).map_err(|e| {
            IngressError::InitializationFailure {
                interface: self.interface.clone(),
                reason: format!("xsks_map insert failed: {e}"),
            }
        })?;
        self.registered.fetch_add(1, Ordering::AcqRel);
        self.metrics.bypass_active.fetch_add(1, Ordering::Relaxed);
        log::debug!("registered socket fd {socket_fd} at queue {slot}");
        Ok(QueueId(slot))
    }

    pub fn registered_count(&self) -> u64 {
        self.registered.load(Ordering::Acquire)
    }
}
