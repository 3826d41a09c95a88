//! Minimal next-hop resolution used by the zero-copy forwarding demo
//! (`demos/relay.rs`) to fill in a destination MAC address for packets it
//! retransmits. Not part of the ingress hot path proper.

use crate::netlink::MacAddress;
use std::io;
use std::net::IpAddr;

pub struct NextHop {
    pub mac_addr: Option<MacAddress>,
}

/// a snapshot of the kernel's ARP/neighbor table, refreshed by re-creating
/// the `Router` (callers needing live updates hold it behind an `ArcSwap` and
/// rebuild periodically, as the retained `demos/relay.rs` forwarding path does).
pub struct Router {
    entries: Vec<(IpAddr, MacAddress)>,
}

impl Router {
    pub fn new() -> io::Result<Self> {
        let table = std::fs::read_to_string("/proc/net/arp")?;
        let mut entries = Vec::new();
        for line in table.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            let Ok(ip) = fields[0].parse::<IpAddr>() else {
                continue;
            };
            let mac_str = fields[3];
            if mac_str == "00:00:00:00:00:00" {
                continue;
            }
            let mut mac = [0u8; 6];
            let mut ok = true;
            for (i, byte) in mac_str.split(':').enumerate() {
                if i >= 6 {
                    ok = false;
                    break;
                }
                match u8::from_str_radix(byte, 16) {
                    Ok(v) => mac[i] = v,
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                entries.push((ip, MacAddress(mac)));
            }
        }
        Ok(Self { entries })
    }

    pub fn route(&self, ip: IpAddr) -> io::Result<NextHop> {
        let mac_addr = self
            .entries
            .iter()
            .find(|(entry_ip, _)| *entry_ip == ip)
            .map(|(_, mac)| *mac);
        Ok(NextHop { mac_addr })
    }
}
