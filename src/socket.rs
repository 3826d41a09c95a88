//! The kernel-bypass socket (C2): owns one NIC queue's four rings plus the
//! UMEM registered against it, and exposes `recv`/`send`/`poll`.
//!
//! Ring layout and the setsockopt/mmap dance follow the in-tree AF_XDP uapi
//! (`linux/if_xdp.h`): `AF_XDP = 44`, `SOL_XDP = 283`, and the fixed
//! per-ring page offsets from spec §6.

use crate::device::Queue;
use crate::error::{IngressError, Result};
use crate::umem::{Frame, FrameOffset, SliceUmemFrame, Umem};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

const AF_XDP: libc::c_int = 44;
const SOL_XDP: libc::c_int = 283;

const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

// spec §6 page-offset constants.
const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_PGOFF_TX_RING: i64 = 0x8000_0000;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;
const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x1_8000_0000;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// a received/transmitted packet descriptor, as laid out by the kernel
/// (`struct xdp_desc`: 16 bytes, no padding).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

fn getsockopt_mmap_offsets(fd: RawFd) -> io::Result<XdpMmapOffsets> {
    let mut offsets = XdpMmapOffsets::default();
    let mut len = std::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            SOL_XDP,
            XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(offsets)
}

fn setsockopt_u32(fd: RawFd, opt: libc::c_int, value: u32) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_XDP,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn mmap_ring(fd: RawFd, offset: i64, len: usize) -> io::Result<*mut libc::c_void> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            offset,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr)
    }
}

/// shared ring bookkeeping: the mmap'd producer/consumer/flags counters plus
/// a local acquire-refreshed cache so hot-path free/available checks don't
/// reload atomics on every descriptor.
struct RawRing {
    map_base: *mut libc::c_void,
    map_len: usize,
    producer: &'static AtomicU32,
    consumer: &'static AtomicU32,
    flags: &'static AtomicU32,
    ring: *mut libc::c_void,
    mask: u32,
    cached_producer: u32,
    cached_consumer: u32,
}

unsafe impl Send for RawRing {}

impl RawRing {
    unsafe fn new(fd: RawFd, offset: i64, off: &XdpRingOffset, capacity: u32, slot_size: usize) -> io::Result<Self> {
        let len = off.desc as usize + capacity as usize * slot_size;
        let base = mmap_ring(fd, offset, len)?;
        let producer = unsafe { &*(base.byte_add(off.producer as usize) as *const AtomicU32) };
        let consumer = unsafe { &*(base.byte_add(off.consumer as usize) as *const AtomicU32) };
        let flags = unsafe { &*(base.byte_add(off.flags as usize) as *const AtomicU32) };
        let ring = unsafe { base.byte_add(off.desc as usize) };
        Ok(Self {
            map_base: base,
            map_len: len,
            producer,
            consumer,
            flags,
            ring,
            mask: capacity - 1,
            cached_producer: 0,
            cached_consumer: 0,
        })
    }

    fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// refresh the locally cached counters. `force` always reloads; otherwise
    /// this is a no-op when the cache already looks sufficient, matching the
    /// amortized acquire-load discipline in spec §4.2.
    fn sync_producer(&mut self) {
        self.cached_producer = self.producer.load(Ordering::Acquire);
    }

    fn sync_consumer(&mut self) {
        self.cached_consumer = self.consumer.load(Ordering::Acquire);
    }

    fn needs_wakeup(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
    }
}

impl Drop for RawRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map_base, self.map_len);
        }
    }
}

/// Fill ring: user -> kernel, frame addresses offered for RX payloads.
pub struct FillRing {
    raw: RawRing,
    local_producer: u32,
}

impl FillRing {
    fn slot(&self, idx: u32) -> *mut u64 {
        unsafe { (self.raw.ring as *mut u64).add((idx & self.raw.mask) as usize) }
    }

    pub fn available(&mut self) -> u32 {
        self.raw.sync_consumer();
        self.raw.capacity() - (self.local_producer.wrapping_sub(self.raw.cached_consumer))
    }

    pub fn sync(&mut self, force: bool) {
        if force {
            self.raw.sync_consumer();
        }
    }

    pub fn write<F: Frame>(&mut self, frame: F) -> std::result::Result<(), ()> {
        if self.available() == 0 {
            return Err(());
        }
        unsafe {
            *self.slot(self.local_producer) = frame.offset().0 as u64;
        }
        self.local_producer = self.local_producer.wrapping_add(1);
        Ok(())
    }

    pub fn commit(&mut self) {
        self.raw.producer.store(self.local_producer, Ordering::Release);
    }
}

/// Completion ring: kernel -> user, frame addresses of transmitted packets.
pub struct CompletionRing {
    raw: RawRing,
    local_consumer: u32,
}

impl CompletionRing {
    fn slot(&self, idx: u32) -> *const u64 {
        unsafe { (self.raw.ring as *const u64).add((idx & self.raw.mask) as usize) }
    }

    pub fn sync(&mut self, _force: bool) {
        self.raw.sync_producer();
    }

    pub fn read(&mut self) -> Option<FrameOffset> {
        if self.local_consumer == self.raw.cached_producer {
            return None;
        }
        let addr = unsafe { *self.slot(self.local_consumer) };
        self.local_consumer = self.local_consumer.wrapping_add(1);
        Some(FrameOffset(addr as usize))
    }

    pub fn commit(&mut self) {
        self.raw.consumer.store(self.local_consumer, Ordering::Release);
    }
}

/// RX ring: kernel -> user, descriptors for received packets.
pub struct RxRing {
    raw: RawRing,
    local_consumer: u32,
}

impl RxRing {
    fn slot(&self, idx: u32) -> *const XdpDesc {
        unsafe { (self.raw.ring as *const XdpDesc).add((idx & self.raw.mask) as usize) }
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity()
    }

    pub fn available(&self) -> u32 {
        self.raw.cached_producer.wrapping_sub(self.local_consumer)
    }

    pub fn sync(&mut self, _force: bool) {
        self.raw.sync_producer();
    }

    pub fn read(&mut self) -> Option<XdpDesc> {
        if self.local_consumer == self.raw.cached_producer {
            return None;
        }
        let desc = unsafe { *self.slot(self.local_consumer) };
        self.local_consumer = self.local_consumer.wrapping_add(1);
        Some(desc)
    }

    pub fn commit(&mut self) {
        self.raw.consumer.store(self.local_consumer, Ordering::Release);
    }
}

/// TX ring: user -> kernel, descriptors for packets to transmit.
pub struct TxRing {
    raw: RawRing,
    local_producer: u32,
}

impl TxRing {
    fn slot(&self, idx: u32) -> *mut XdpDesc {
        unsafe { (self.raw.ring as *mut XdpDesc).add((idx & self.raw.mask) as usize) }
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity()
    }

    pub fn available(&mut self) -> u32 {
        self.raw.sync_consumer();
        self.raw.capacity() - self.local_producer.wrapping_sub(self.raw.cached_consumer)
    }

    pub fn sync(&mut self, force: bool) {
        if force {
            self.raw.sync_consumer();
        }
    }

    pub fn write<F: Frame>(&mut self, frame: F, options: u32) -> std::result::Result<(), ()> {
        if self.available() == 0 {
            return Err(());
        }
        unsafe {
            let slot = self.slot(self.local_producer);
            (*slot).addr = frame.offset().0 as u64;
            (*slot).len = frame.len() as u32;
            (*slot).options = options;
        }
        self.local_producer = self.local_producer.wrapping_add(1);
        Ok(())
    }

    pub fn commit(&mut self) {
        self.raw.producer.store(self.local_producer, Ordering::Release);
    }

    /// whether the kernel's need-wakeup flag is set for this ring; if so a
    /// zero-length `sendto` must be issued to arm it (spec §4.2). Use the
    /// free function `wake_tx`, which has access to the socket fd.
    pub fn needs_wakeup(&self) -> bool {
        self.raw.needs_wakeup()
    }
}

/// the two rings handed back when a socket is configured for receive.
pub struct Rx {
    pub fill: FillRing,
    pub ring: Option<RxRing>,
}

/// the two rings handed back when a socket is configured for transmit.
pub struct Tx {
    pub completion: CompletionRing,
    pub ring: Option<TxRing>,
}

/// the kernel-bypass socket itself: one UMEM, bound to one NIC queue.
pub struct Socket<U: Umem> {
    fd: OwnedFd,
    umem: U,
    zero_copy: bool,
}

impl<U: Umem> Socket<U> {
    pub fn umem(&self) -> &U {
        &self.umem
    }

    pub fn zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// set up an RX-only socket (spec §4.2 setup sequence, steps 1-8, minus TX).
    pub fn rx(queue: Queue, umem: U, zero_copy: bool, fill_size: u32, rx_size: u32) -> Result<(Self, Rx)> {
        let (socket, rx, _tx) = Self::build(queue, umem, zero_copy, fill_size, rx_size, 0, 0, true, false)?;
        Ok((socket, rx.expect("rx requested")))
    }

    /// set up a bidirectional RX+TX socket.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Queue,
        umem: U,
        zero_copy: bool,
        fill_size: u32,
        rx_size: u32,
        cq_size: u32,
        tx_size: u32,
    ) -> Result<(Self, Rx, Tx)> {
        let (socket, rx, tx) = Self::build(queue, umem, zero_copy, fill_size, rx_size, cq_size, tx_size, true, true)?;
        Ok((socket, rx.expect("rx requested"), tx.expect("tx requested")))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        queue: Queue,
        umem: U,
        zero_copy: bool,
        fill_size: u32,
        rx_size: u32,
        cq_size: u32,
        tx_size: u32,
        want_rx: bool,
        want_tx: bool,
    ) -> Result<(Self, Option<Rx>, Option<Tx>)> {
        let if_index = queue.if_index();
        let queue_id = queue.queue_id().0 as u32;

        let raw_fd = unsafe { libc::socket(AF_XDP, libc::SOCK_RAW, 0) };
        if raw_fd < 0 {
            return Err(IngressError::InitializationFailure {
                interface: format!("if_index={if_index}"),
                reason: format!("socket(AF_XDP) failed: {}", io::Error::last_os_error()),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let reg = XdpUmemReg {
            addr: umem.as_ptr() as u64,
            len: (umem.frame_count() * umem.frame_size() as usize) as u64,
            chunk_size: umem.frame_size(),
            headroom: 0,
            flags: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_XDP,
                XDP_UMEM_REG,
                &reg as *const _ as *const libc::c_void,
                std::mem::size_of::<XdpUmemReg>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(IngressError::InitializationFailure {
                interface: format!("if_index={if_index}"),
                reason: format!("XDP_UMEM_REG failed: {}", io::Error::last_os_error()),
            });
        }

        setsockopt_u32(fd.as_raw_fd(), XDP_UMEM_FILL_RING, fill_size).map_err(|e| {
            IngressError::InitializationFailure {
                interface: format!("if_index={if_index}"),
                reason: format!("XDP_UMEM_FILL_RING failed: {e}"),
            }
        })?;
        setsockopt_u32(fd.as_raw_fd(), XDP_UMEM_COMPLETION_RING, cq_size.max(fill_size)).map_err(|e| {
            IngressError::InitializationFailure {
                interface: format!("if_index={if_index}"),
                reason: format!("XDP_UMEM_COMPLETION_RING failed: {e}"),
            }
        })?;
        if want_rx {
            setsockopt_u32(fd.as_raw_fd(), XDP_RX_RING, rx_size).map_err(|e| {
                IngressError::InitializationFailure {
                    interface: format!("if_index={if_index}"),
                    reason: format!("XDP_RX_RING failed: {e}"),
                }
            })?;
        }
        if want_tx {
            setsockopt_u32(fd.as_raw_fd(), XDP_TX_RING, tx_size).map_err(|e| {
                IngressError::InitializationFailure {
                    interface: format!("if_index={if_index}"),
                    reason: format!("XDP_TX_RING failed: {e}"),
                }
            })?;
        }

        let offsets = getsockopt_mmap_offsets(fd.as_raw_fd()).map_err(|e| IngressError::InitializationFailure {
            interface: format!("if_index={if_index}"),
            reason: format!("XDP_MMAP_OFFSETS failed: {e}"),
        })?;

        let fill = unsafe {
            RawRing::new(
                fd.as_raw_fd(),
                XDP_UMEM_PGOFF_FILL_RING,
                &offsets.fr,
                fill_size,
                std::mem::size_of::<u64>(),
            )
        }
        .map_err(|e| IngressError::InitializationFailure {
            interface: format!("if_index={if_index}"),
            reason: format!("mmap fill ring failed: {e}"),
        })?;

        let completion = unsafe {
            RawRing::new(
                fd.as_raw_fd(),
                XDP_UMEM_PGOFF_COMPLETION_RING,
                &offsets.cr,
                cq_size.max(fill_size),
                std::mem::size_of::<u64>(),
            )
        }
        .map_err(|e| IngressError::InitializationFailure {
            interface: format!("if_index={if_index}"),
            reason: format!("mmap completion ring failed: {e}"),
        })?;

        let rx_ring = if want_rx {
            Some(
                unsafe {
                    RawRing::new(
                        fd.as_raw_fd(),
                        XDP_PGOFF_RX_RING,
                        &offsets.rx,
                        rx_size,
                        std::mem::size_of::<XdpDesc>(),
                    )
                }
                .map_err(|e| IngressError::InitializationFailure {
                    interface: format!("if_index={if_index}"),
                    reason: format!("mmap rx ring failed: {e}"),
                })?,
            )
        } else {
            None
        };

        let tx_ring = if want_tx {
            Some(
                unsafe {
                    RawRing::new(
                        fd.as_raw_fd(),
                        XDP_PGOFF_TX_RING,
                        &offsets.tx,
                        tx_size,
                        std::mem::size_of::<XdpDesc>(),
                    )
                }
                .map_err(|e| IngressError::InitializationFailure {
                    interface: format!("if_index={if_index}"),
                    reason: format!("mmap tx ring failed: {e}"),
                })?,
            )
        } else {
            None
        };

        // bind: zero-copy + need-wakeup first, falling back to copy + need-wakeup.
        let zero_copy = Self::bind(fd.as_raw_fd(), if_index, queue_id, zero_copy)?;

        let rx = if want_rx {
            Some(Rx {
                fill: FillRing {
                    raw: fill,
                    local_producer: 0,
                },
                ring: rx_ring.map(|raw| RxRing {
                    raw,
                    local_consumer: 0,
                }),
            })
        } else {
            None
        };

        let tx = if want_tx {
            Some(Tx {
                completion: CompletionRing {
                    raw: completion,
                    local_consumer: 0,
                },
                ring: tx_ring.map(|raw| TxRing {
                    raw,
                    local_producer: 0,
                }),
            })
        } else {
            // still need somewhere to put the completion ring if rx-only but we
            // configured a completion queue above; return it bundled as Tx
            // only when transmit was actually requested.
            None
        };

        Ok((
            Socket {
                fd,
                umem,
                zero_copy,
            },
            rx,
            tx,
        ))
    }

    fn bind(fd: RawFd, if_index: u32, queue_id: u32, request_zero_copy: bool) -> Result<bool> {
        let try_bind = |flags: u16| -> io::Result<()> {
            let sa = SockaddrXdp {
                sxdp_family: AF_XDP as u16,
                sxdp_flags: flags,
                sxdp_ifindex: if_index,
                sxdp_queue_id: queue_id,
                sxdp_shared_umem_fd: 0,
            };
            let rc = unsafe {
                libc::bind(
                    fd,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        };

        if request_zero_copy {
            match try_bind(XDP_ZEROCOPY | XDP_USE_NEED_WAKEUP) {
                Ok(()) => return Ok(true),
                Err(e) => {
                    log::warn!("zero-copy bind failed on queue {queue_id} (if_index {if_index}): {e}, retrying in copy mode");
                }
            }
        }

        try_bind(XDP_COPY | XDP_USE_NEED_WAKEUP).map_err(|e| IngressError::InitializationFailure {
            interface: format!("if_index={if_index}"),
            reason: format!("bind (copy mode) failed on queue {queue_id}: {e}"),
        })?;
        Ok(false)
    }

    /// transmit `payloads` as a batch (spec §4.2 transmit contract): reserve
    /// one TX descriptor per payload, copy each payload into a free frame,
    /// publish the batch, and wake the kernel if the ring's need-wakeup flag
    /// is set. Returns the number of payloads actually queued, which is less
    /// than `payloads.len()` if the UMEM or TX ring runs out of room first
    /// (non-fatal, spec §8 "RingTransient").
    pub fn send(&mut self, tx: &mut TxRing, payloads: &[&[u8]]) -> Result<usize> {
        tx.sync(true);
        let mut sent = 0usize;
        for payload in payloads {
            let Some(frame) = self.umem.reserve() else { break };
            let offset = frame.offset();
            if payload.len() > self.umem.frame_size() as usize {
                self.umem.release(offset);
                return Err(IngressError::ParseMalformed {
                    reason: "payload exceeds frame size",
                });
            }
            // Safety: the frame was just reserved from the free list, so
            // this socket is its only owner until handed to the TX ring below.
            unsafe {
                self.umem.frame_bytes_mut(offset, payload.len()).copy_from_slice(payload);
            }
            let tx_frame = SliceUmemFrame::from_offset(offset, payload.len());
            if tx.write(tx_frame, 0).is_err() {
                self.umem.release(offset);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            tx.commit();
            wake_tx(self, tx)?;
        }
        Ok(sent)
    }

    /// poll the socket fd, matching the worker loop's blocking point (spec §5).
    pub fn poll(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fds[0].revents & libc::POLLIN != 0)
    }
}

impl<U: Umem> AsRawFd for Socket<U> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// issue the zero-length `sendto` that arms the kernel when the TX ring's
/// need-wakeup flag is set. Pulled out of `TxRing::wake` because it needs the
/// socket fd, not the ring's own mapping.
pub fn wake_tx<U: Umem>(socket: &Socket<U>, tx: &TxRing) -> io::Result<()> {
    if !tx.needs_wakeup() {
        return Ok(());
    }
    let rc = unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            std::ptr::null(),
            0,
            libc::MSG_DONTWAIT,
            std::ptr::null(),
            0,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOBUFS) | Some(libc::EAGAIN) | Some(libc::EBUSY) => Ok(()),
            _ => Err(err),
        }
    } else {
        Ok(())
    }
}
