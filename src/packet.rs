//! Ethernet/IPv4/UDP header parsing and destination-port classification.

use crate::error::{IngressError, Result};

pub const ETH_HEADER_SIZE: usize = 14;
pub const IP_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_UDP: u8 = 17;

/// logical category assigned to a packet by destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowClass {
    Gossip,
    Shred,
    TxLegacy,
    TxQuic,
    Rpc,
    Repair,
    Vote,
    Unknown,
}

/// destination-port -> flow-class table. Classification is a pure function of
/// `dst_port`; ties are resolved by first match in this enumeration order.
#[derive(Debug, Clone)]
pub struct PortMap {
    entries: Vec<(u16, FlowClass)>,
}

impl PortMap {
    pub fn new(entries: Vec<(u16, FlowClass)>) -> Self {
        Self { entries }
    }

    #[inline]
    pub fn classify(&self, dst_port: u16) -> FlowClass {
        for (port, class) in &self.entries {
            if *port == dst_port {
                return *class;
            }
        }
        FlowClass::Unknown
    }
}

impl Default for PortMap {
    fn default() -> Self {
        // a plausible default enumeration: gossip, shred repair/replication,
        // legacy tx ingress, QUIC tx ingress, RPC, repair, vote.
        Self::new(vec![
            (8001, FlowClass::Gossip),
            (8002, FlowClass::Shred),
            (8003, FlowClass::TxLegacy),
            (8004, FlowClass::TxQuic),
            (8899, FlowClass::Rpc),
            (8008, FlowClass::Repair),
            (8005, FlowClass::Vote),
        ])
    }
}

/// a parsed packet borrowing its payload from the underlying frame.
pub struct ParsedPacket<'a> {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub payload: &'a [u8],
    pub flow_class: FlowClass,
}

/// parse an Ethernet/IPv4/UDP frame and classify it by destination port.
///
/// Mirrors the filter program's algorithm (spec §4.1) so that the fallback
/// software path and the AF_XDP worker path reach identical classification.
pub fn parse<'a>(frame: &'a [u8], port_map: &PortMap) -> Result<ParsedPacket<'a>> {
    if frame.len() < ETH_HEADER_SIZE + IP_HEADER_SIZE {
        return Err(IngressError::ParseMalformed {
            reason: "frame shorter than Ethernet+IPv4 minimum headers",
        });
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return Err(IngressError::ParseMalformed {
            reason: "non-IPv4 EtherType",
        });
    }

    let ip = &frame[ETH_HEADER_SIZE..];
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < IP_HEADER_SIZE {
        return Err(IngressError::ParseMalformed {
            reason: "IPv4 IHL below minimum",
        });
    }
    if frame.len() < ETH_HEADER_SIZE + ihl + UDP_HEADER_SIZE {
        return Err(IngressError::ParseMalformed {
            reason: "frame shorter than IP header + UDP header",
        });
    }

    let protocol = ip[9];
    if protocol != IPPROTO_UDP {
        return Err(IngressError::ParseMalformed {
            reason: "non-UDP transport protocol",
        });
    }

    let src_ip = [ip[12], ip[13], ip[14], ip[15]];
    let dst_ip = [ip[16], ip[17], ip[18], ip[19]];

    let udp = &frame[ETH_HEADER_SIZE + ihl..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);

    let payload_start = ETH_HEADER_SIZE + ihl + UDP_HEADER_SIZE;
    let payload = &frame[payload_start..];

    let flow_class = port_map.classify(dst_port);

    Ok(ParsedPacket {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        payload,
        flow_class,
    })
}

/// write an Ethernet header in place (kept from the teacher's forwarding path).
pub fn write_eth_header(packet: &mut [u8], src_mac: &[u8; 6], dst_mac: &[u8; 6]) {
    packet[0..6].copy_from_slice(dst_mac);
    packet[6..12].copy_from_slice(src_mac);
    packet[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
}

/// write an IPv4 header in place; `total_len` is the IP-payload length (UDP header + data).
pub fn write_ip_header(
    buf: &mut [u8],
    src_ip: &std::net::Ipv4Addr,
    dst_ip: &std::net::Ipv4Addr,
    udp_len: u16,
) {
    let total_len = IP_HEADER_SIZE as u16 + udp_len;
    buf[0] = 0x45; // version 4, IHL 5
    buf[1] = 0; // DSCP/ECN
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buf[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    buf[8] = 64; // TTL
    buf[9] = IPPROTO_UDP;
    buf[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, filled below
    buf[12..16].copy_from_slice(&src_ip.octets());
    buf[16..20].copy_from_slice(&dst_ip.octets());

    let checksum = ipv4_checksum(&buf[..IP_HEADER_SIZE]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// write a UDP header and payload in place, with a real checksum computed
/// over the IPv4 pseudo-header, the UDP header, and the payload (RFC 768).
/// `buf` must be sized for exactly `UDP_HEADER_SIZE + payload.len()` bytes.
pub fn write_udp_header(
    buf: &mut [u8],
    src_ip: &std::net::Ipv4Addr,
    src_port: u16,
    dst_ip: &std::net::Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&0u16.to_be_bytes());
    buf[UDP_HEADER_SIZE..udp_len].copy_from_slice(payload);

    let checksum = udp_checksum(src_ip, dst_ip, &buf[..udp_len]);
    buf[6..8].copy_from_slice(&checksum.to_be_bytes());
}

/// RFC 768 UDP checksum: ones'-complement sum of the IPv4 pseudo-header
/// (source/dest addresses, zero byte, protocol, UDP length) followed by the
/// UDP segment itself, folded to 16 bits and complemented.
fn udp_checksum(src_ip: &std::net::Ipv4Addr, dst_ip: &std::net::Ipv4Addr, udp_segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for pair in src_ip.octets().chunks(2).chain(dst_ip.octets().chunks(2)) {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    sum += IPPROTO_UDP as u32;
    sum += udp_segment.len() as u32;
    for chunk in udp_segment.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let checksum = !(sum as u16);
    // RFC 768: a computed checksum of all-zeros is transmitted as all-ones,
    // since all-zeros on the wire means "checksum not computed".
    if checksum == 0 {
        0xffff
    } else {
        checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HEADER_SIZE + IP_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let ip = &mut frame[ETH_HEADER_SIZE..];
        ip[0] = 0x45;
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let udp = &mut frame[ETH_HEADER_SIZE + IP_HEADER_SIZE..];
        udp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        let payload_start = ETH_HEADER_SIZE + IP_HEADER_SIZE + UDP_HEADER_SIZE;
        frame[payload_start..].copy_from_slice(payload);
        frame
    }

    #[test]
    fn classify_gossip_packet() {
        let port_map = PortMap::default();
        let frame = synth_frame(8001, b"hello");
        let parsed = parse(&frame, &port_map).unwrap();
        assert_eq!(parsed.flow_class, FlowClass::Gossip);
        assert_eq!(parsed.payload, b"hello");
        assert_eq!(parsed.dst_port, 8001);
        assert_eq!(parsed.src_ip, [10, 0, 0, 1]);
        assert_eq!(parsed.dst_ip, [10, 0, 0, 2]);
    }

    #[test]
    fn reject_non_ipv4() {
        let port_map = PortMap::default();
        let mut frame = synth_frame(8001, b"hello");
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
        let err = parse(&frame, &port_map).unwrap_err();
        assert!(matches!(err, IngressError::ParseMalformed { .. }));
    }

    #[test]
    fn classification_totality_unmapped_port() {
        let port_map = PortMap::default();
        let frame = synth_frame(9999, b"x");
        let parsed = parse(&frame, &port_map).unwrap();
        assert_eq!(parsed.flow_class, FlowClass::Unknown);
    }

    #[test]
    fn header_round_trip() {
        let src_mac = [1, 2, 3, 4, 5, 6];
        let dst_mac = [6, 5, 4, 3, 2, 1];
        let src_ip = std::net::Ipv4Addr::new(192, 168, 1, 1);
        let dst_ip = std::net::Ipv4Addr::new(192, 168, 1, 2);
        let payload = b"payload-bytes";
        let mut buf = vec![0u8; ETH_HEADER_SIZE + IP_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()];
        write_eth_header(&mut buf, &src_mac, &dst_mac);
        write_ip_header(&mut buf[ETH_HEADER_SIZE..], &src_ip, &dst_ip, (UDP_HEADER_SIZE + payload.len()) as u16);
        write_udp_header(
            &mut buf[ETH_HEADER_SIZE + IP_HEADER_SIZE..],
            &src_ip,
            4444,
            &dst_ip,
            5555,
            payload,
        );

        let port_map = PortMap::new(vec![(5555, FlowClass::Rpc)]);
        let parsed = parse(&buf, &port_map).unwrap();
        assert_eq!(parsed.dst_port, 5555);
        assert_eq!(parsed.src_port, 4444);
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.flow_class, FlowClass::Rpc);
    }

    #[test]
    fn udp_checksum_is_nonzero_and_stable() {
        let src_ip = std::net::Ipv4Addr::new(10, 0, 0, 1);
        let dst_ip = std::net::Ipv4Addr::new(10, 0, 0, 2);
        let payload = b"abc";
        let mut buf = vec![0u8; UDP_HEADER_SIZE + payload.len()];
        write_udp_header(&mut buf, &src_ip, 1, &dst_ip, 2, payload);
        let checksum = u16::from_be_bytes([buf[6], buf[7]]);
        assert_ne!(checksum, 0, "a real checksum must be written, not the zero placeholder");

        let mut again = vec![0u8; UDP_HEADER_SIZE + payload.len()];
        write_udp_header(&mut again, &src_ip, 1, &dst_ip, 2, payload);
        assert_eq!(buf, again);
    }
}
