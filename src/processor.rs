//! Packet classifier/dispatcher worker pool (C4, spec.md §4.4).
//!
//! Workers poll their socket, drain a batch of RX descriptors, parse and
//! classify each frame, and hand the payload to a registered per-class
//! handler without letting the slice outlive the call. When the kernel-bypass
//! path fails to initialize, `FallbackPath` opens an ordinary UDP socket and
//! drives the same classify/dispatch logic off `recvmmsg` batches instead.

use crate::error::{IngressError, Result};
use crate::metrics::Metrics;
use crate::packet::{self, FlowClass, PortMap};
use crate::socket::{Rx, Socket};
use crate::umem::{Frame as _, FrameOffset, Umem};
use std::collections::HashMap;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// a registered callback invoked with a packet's UDP payload once classified.
/// Boxed so callers can register closures capturing their own state.
pub type Handler = Box<dyn Fn(&[u8]) + Send + Sync>;

const DEFAULT_BATCH: usize = 32;
const RECVMMSG_BATCH: usize = 32;
const MAX_FRAME: usize = 2048;

/// whichever receive path is currently driving a worker (spec.md §4.4,
/// "statistics include a flag indicating which path is active").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePath {
    KernelBypass,
    Fallback,
}

struct HandlerTable {
    by_class: HashMap<FlowClass, Handler>,
}

impl HandlerTable {
    fn new() -> Self {
        Self { by_class: HashMap::new() }
    }

    fn dispatch(&self, class: FlowClass, payload: &[u8]) {
        if let Some(handler) = self.by_class.get(&class) {
            handler(payload);
        }
    }
}

/// the classify/dispatch worker pool sitting above either an AF_XDP socket
/// per queue or a single fallback UDP socket.
pub struct PacketProcessor {
    port_map: Arc<PortMap>,
    metrics: Arc<Metrics>,
    handlers: Arc<HandlerTable>,
    stop_flag: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active_path: Arc<Mutex<ActivePath>>,
}

impl PacketProcessor {
    pub fn new(port_map: PortMap, metrics: Arc<Metrics>) -> Self {
        Self {
            port_map: Arc::new(port_map),
            metrics,
            handlers: Arc::new(HandlerTable::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            active_path: Arc::new(Mutex::new(ActivePath::KernelBypass)),
        }
    }

    /// register (or replace) the handler invoked for packets of `class`.
    /// Must be called before `start`.
    pub fn register_handler(&mut self, class: FlowClass, handler: Handler) {
        Arc::get_mut(&mut self.handlers)
            .expect("register_handler called after start")
            .by_class
            .insert(class, handler);
    }

    pub fn active_path(&self) -> ActivePath {
        *self.active_path.lock().expect("active_path mutex poisoned")
    }

    /// spawn one worker per AF_XDP socket/rx-ring pair, each pinned to the
    /// given CPU ids (one id per socket, spec.md §5 "N worker threads").
    pub fn start_kernel_bypass<U: Umem + Send + 'static>(
        &self,
        sockets: Vec<(Socket<U>, Rx, usize)>,
        poll_timeout_ms: i32,
    ) {
        *self.active_path.lock().expect("active_path mutex poisoned") = ActivePath::KernelBypass;
        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        for (socket, rx, cpu_id) in sockets {
            let port_map = Arc::clone(&self.port_map);
            let metrics = Arc::clone(&self.metrics);
            let handlers = Arc::clone(&self.handlers);
            let stop_flag = Arc::clone(&self.stop_flag);
            workers.push(std::thread::spawn(move || {
                if crate::cpu::set_cpu_affinity([cpu_id]).is_err() {
                    log::warn!("failed to pin worker thread to cpu {cpu_id}");
                }
                kernel_bypass_worker(socket, rx, &port_map, &metrics, &handlers, &stop_flag, poll_timeout_ms);
            }));
        }
    }

    /// fall back to a plain UDP socket driven by `recvmmsg` batches
    /// (spec.md §4.4 "Fallback path"), run on the calling thread's pool.
    pub fn start_fallback(&self, bind_addr: &str, cpu_id: Option<usize>) -> Result<()> {
        let socket = UdpSocket::bind(bind_addr).map_err(|e| IngressError::InitializationFailure {
            interface: bind_addr.to_string(),
            reason: format!("fallback udp bind failed: {e}"),
        })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(IngressError::from)?;
        *self.active_path.lock().expect("active_path mutex poisoned") = ActivePath::Fallback;

        let port_map = Arc::clone(&self.port_map);
        let metrics = Arc::clone(&self.metrics);
        let handlers = Arc::clone(&self.handlers);
        let stop_flag = Arc::clone(&self.stop_flag);
        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        workers.push(std::thread::spawn(move || {
            if let Some(cpu_id) = cpu_id {
                if crate::cpu::set_cpu_affinity([cpu_id]).is_err() {
                    log::warn!("failed to pin fallback worker thread to cpu {cpu_id}");
                }
            }
            fallback_worker(socket, &port_map, &metrics, &handlers, &stop_flag);
        }));
        Ok(())
    }

    /// flip the cooperative shutdown flag and join every worker thread.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn kernel_bypass_worker<U: Umem>(
    mut socket: Socket<U>,
    rx: Rx,
    port_map: &PortMap,
    metrics: &Metrics,
    handlers: &HandlerTable,
    stop_flag: &AtomicBool,
    poll_timeout_ms: i32,
) {
    let mut fill = rx.fill;
    let mut ring = rx.ring.expect("kernel-bypass worker requires an rx ring");

    while fill.available() > 0 {
        if let Some(frame) = socket.umem().reserve() {
            let offset = frame.offset();
            if fill.write(frame).is_err() {
                socket.umem().release(offset);
                break;
            }
        } else {
            break;
        }
    }
    fill.commit();

    while !stop_flag.load(Ordering::Relaxed) {
        match socket.poll(poll_timeout_ms) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::warn!("socket poll failed: {e}");
                continue;
            }
        }
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        ring.sync(false);
        let mut processed = 0usize;
        while processed < DEFAULT_BATCH {
            let Some(desc) = ring.read() else { break };
            processed += 1;

            let frame_offset = FrameOffset(desc.addr as usize);
            // Safety: the frame at `frame_offset` was handed to the kernel
            // via the fill ring and is returned to us exclusively through
            // this RX descriptor (spec.md §5 single-socket ownership rule).
            let frame_bytes = unsafe { socket.umem().frame_bytes(frame_offset, desc.len as usize) };

            metrics.packets_received.fetch_add(1, Ordering::Relaxed);
            match packet::parse(frame_bytes, port_map) {
                Ok(parsed) => {
                    metrics.record_class(parsed.flow_class);
                    handlers.dispatch(parsed.flow_class, parsed.payload);
                }
                Err(IngressError::ParseMalformed { .. }) => {
                    metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    metrics.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }

            socket.umem().release(frame_offset);
        }
        ring.commit();

        fill.sync(false);
        while fill.available() > 0 {
            if let Some(frame) = socket.umem().reserve() {
                let offset = frame.offset();
                if fill.write(frame).is_err() {
                    socket.umem().release(offset);
                    break;
                }
            } else {
                break;
            }
        }
        fill.commit();
    }
}

fn fallback_worker(
    socket: UdpSocket,
    port_map: &PortMap,
    metrics: &Metrics,
    handlers: &HandlerTable,
    stop_flag: &AtomicBool,
) {
    let fd = socket.as_raw_fd();
    let mut buffers = vec![[0u8; MAX_FRAME]; RECVMMSG_BATCH];
    let mut iovecs: Vec<libc::iovec> = buffers
        .iter_mut()
        .map(|buf| libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() })
        .collect();
    let mut msgs: Vec<libc::mmsghdr> = iovecs
        .iter_mut()
        .map(|iov| libc::mmsghdr {
            msg_hdr: libc::msghdr {
                msg_name: std::ptr::null_mut(),
                msg_namelen: 0,
                msg_iov: iov as *mut libc::iovec,
                msg_iovlen: 1,
                msg_control: std::ptr::null_mut(),
                msg_controllen: 0,
                msg_flags: 0,
            },
            msg_len: 0,
        })
        .collect();

    while !stop_flag.load(Ordering::Relaxed) {
        // Safety: each msgs[i].msg_hdr.msg_iov points at iovecs[i], which
        // points at buffers[i]; neither Vec is reallocated for the lifetime
        // of this call, and the kernel writes at most iov_len bytes into
        // each. `timeout` is null, but the socket's SO_RCVTIMEO (set in
        // start_fallback) still bounds how long recvmmsg blocks.
        let received = unsafe {
            libc::recvmmsg(fd, msgs.as_mut_ptr(), msgs.len() as u32, 0, std::ptr::null_mut())
        };

        if received < 0 {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => continue,
                _ => {
                    log::warn!("fallback recvmmsg failed: {err}");
                    continue;
                }
            }
        }

        metrics.packets_received.fetch_add(received as u64, Ordering::Relaxed);
        for (buf, msg) in buffers.iter().zip(msgs.iter()).take(received as usize) {
            let payload = &buf[..msg.msg_len as usize];
            match packet::parse(payload, port_map) {
                Ok(parsed) => {
                    metrics.record_class(parsed.flow_class);
                    handlers.dispatch(parsed.flow_class, parsed.payload);
                }
                Err(IngressError::ParseMalformed { .. }) => {
                    metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    metrics.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatch_routes_to_registered_class_only() {
        let mut table = HandlerTable::new();
        let gossip_hits = Arc::new(AtomicUsize::new(0));
        let rpc_hits = Arc::new(AtomicUsize::new(0));
        let g = Arc::clone(&gossip_hits);
        let r = Arc::clone(&rpc_hits);
        table.by_class.insert(FlowClass::Gossip, Box::new(move |_| { g.fetch_add(1, Ordering::Relaxed); }));
        table.by_class.insert(FlowClass::Rpc, Box::new(move |_| { r.fetch_add(1, Ordering::Relaxed); }));

        table.dispatch(FlowClass::Gossip, b"x");
        table.dispatch(FlowClass::Unknown, b"y");

        assert_eq!(gossip_hits.load(Ordering::Relaxed), 1);
        assert_eq!(rpc_hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn new_processor_defaults_to_kernel_bypass_path() {
        let processor = PacketProcessor::new(PortMap::default(), Arc::new(Metrics::new()));
        assert_eq!(processor.active_path(), ActivePath::KernelBypass);
    }
}
