//! NIC interface and hardware-queue discovery: resolving an interface name to
//! an index, reading its MAC/IPv4 address, and querying driver ring sizes via
//! the ethtool ioctl so the UMEM frame count can match the hardware.

use crate::netlink::MacAddress;
use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const IFNAMSIZ: usize = 16;
const SIOCGIFINDEX: libc::c_ulong = 0x8933;
const SIOCGIFHWADDR: libc::c_ulong = 0x8927;
const SIOCGIFADDR: libc::c_ulong = 0x8915;
const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GRINGPARAM: u32 = 0x00000010;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_union: IfReqUnion,
}

#[repr(C)]
union IfReqUnion {
    ifr_addr: libc::sockaddr,
    ifr_ifindex: libc::c_int,
    ifr_data: *mut libc::c_void,
}

#[repr(C)]
struct EthtoolRingparam {
    cmd: u32,
    rx_max_pending: u32,
    rx_mini_max_pending: u32,
    rx_jumbo_max_pending: u32,
    tx_max_pending: u32,
    rx_pending: u32,
    rx_mini_pending: u32,
    rx_jumbo_pending: u32,
    tx_pending: u32,
}

fn ifreq_with_name(name: &str) -> io::Result<IfReq> {
    if name.len() >= IFNAMSIZ {
        return Err(io::Error::other("interface name too long"));
    }
    let mut ifr_name = [0 as libc::c_char; IFNAMSIZ];
    for (dst, src) in ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    Ok(IfReq {
        ifr_name,
        ifr_union: IfReqUnion { ifr_ifindex: 0 },
    })
}

fn ioctl_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// a single hardware receive/transmit queue, identified by its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct RingSizes {
    pub rx: u32,
    pub tx: u32,
}

impl Default for RingSizes {
    fn default() -> Self {
        // spec §6: ring capacities default to 2048 and must be powers of two.
        Self { rx: 2048, tx: 2048 }
    }
}

/// a queue opened on a `NetworkDevice`, ready to be bound by a `Socket`.
pub struct Queue {
    if_index: u32,
    if_name: String,
    queue_id: QueueId,
}

impl Queue {
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// query the driver for this queue's ring capacities via ethtool. Returns
    /// `None` if the driver doesn't support the ioctl or the interface name no
    /// longer resolves; callers fall back to `RingSizes::default()`.
    pub fn ring_sizes(&self) -> Option<RingSizes> {
        let sock = ioctl_socket().ok()?;
        let mut ring = EthtoolRingparam {
            cmd: ETHTOOL_GRINGPARAM,
            rx_max_pending: 0,
            rx_mini_max_pending: 0,
            rx_jumbo_max_pending: 0,
            tx_max_pending: 0,
            rx_pending: 0,
            rx_mini_pending: 0,
            rx_jumbo_pending: 0,
            tx_pending: 0,
        };
        let mut ifr = ifreq_with_name(&self.if_name).ok()?;
        ifr.ifr_union.ifr_data = &mut ring as *mut _ as *mut libc::c_void;

        let rc = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCETHTOOL, &mut ifr) };
        if rc != 0 {
            return None;
        }
        if ring.rx_pending == 0 || ring.tx_pending == 0 {
            return None;
        }
        Some(RingSizes {
            rx: ring.rx_pending,
            tx: ring.tx_pending,
        })
    }
}

/// a network interface this process may bind AF_XDP sockets against.
pub struct NetworkDevice {
    name: String,
    if_index: u32,
}

impl NetworkDevice {
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let c_name = CString::new(name.as_str())
            .map_err(|_| io::Error::other("interface name contains NUL"))?;
        let if_index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if if_index == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { name, if_index })
    }

    pub fn new_from_index(if_index: u32) -> io::Result<Self> {
        let mut buf = [0u8; libc::IF_NAMESIZE];
        let ptr = unsafe { libc::if_indextoname(if_index, buf.as_mut_ptr() as *mut libc::c_char) };
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..len]).into_owned();
        Ok(Self { name, if_index })
    }

    /// resolve the interface carrying the default IPv4 route by scanning
    /// `/proc/net/route` for a zero destination with the lowest metric.
    pub fn new_from_default_route() -> io::Result<Self> {
        let table = std::fs::read_to_string("/proc/net/route")?;
        let mut best: Option<(u32, String)> = None;
        for line in table.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 7 {
                continue;
            }
            let iface = fields[0];
            let destination = u32::from_str_radix(fields[1], 16).unwrap_or(u32::MAX);
            let metric: u32 = fields[6].parse().unwrap_or(u32::MAX);
            if destination == 0 {
                if best.as_ref().map(|(m, _)| metric < *m).unwrap_or(true) {
                    best = Some((metric, iface.to_string()));
                }
            }
        }
        let (_, iface) = best.ok_or_else(|| io::Error::other("no default route found"))?;
        Self::new(iface)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn mac_addr(&self) -> io::Result<MacAddress> {
        let sock = ioctl_socket()?;
        let mut ifr = ifreq_with_name(&self.name)?;
        let rc = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFHWADDR, &mut ifr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let sa = unsafe { ifr.ifr_union.ifr_addr };
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&sa.sa_data[0..6].iter().map(|&b| b as u8).collect::<Vec<_>>());
        Ok(MacAddress(mac))
    }

    pub fn ipv4_addr(&self) -> io::Result<Ipv4Addr> {
        let sock = ioctl_socket()?;
        let mut ifr = ifreq_with_name(&self.name)?;
        let rc = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFADDR, &mut ifr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let sa = unsafe { ifr.ifr_union.ifr_addr };
        let sin: libc::sockaddr_in = unsafe { std::mem::transmute_copy(&sa) };
        Ok(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
    }

    pub fn open_queue(&self, queue_id: QueueId) -> io::Result<Queue> {
        Ok(Queue {
            if_index: self.if_index,
            if_name: self.name.clone(),
            queue_id,
        })
    }
}
