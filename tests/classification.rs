//! End-to-end classify/dispatch scenarios (gossip packet, non-IPv4 reject).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use validator_ingress::metrics::Metrics;
use validator_ingress::packet::{self, FlowClass, PortMap};

const ETH_HEADER_SIZE: usize = 14;
const IP_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;

fn synth_frame(ethertype: u16, protocol: u8, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HEADER_SIZE + IP_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()];
    frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
    let ip = &mut frame[ETH_HEADER_SIZE..];
    ip[0] = 0x45;
    ip[9] = protocol;
    ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
    let udp = &mut frame[ETH_HEADER_SIZE + IP_HEADER_SIZE..];
    udp[0..2].copy_from_slice(&1111u16.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    let payload_start = ETH_HEADER_SIZE + IP_HEADER_SIZE + UDP_HEADER_SIZE;
    frame[payload_start..].copy_from_slice(payload);
    frame
}

#[test]
fn classify_gossip_packet_invokes_handler_once() {
    let metrics = Arc::new(Metrics::new());
    let port_map = PortMap::default();
    let frame = synth_frame(0x0800, 17, 8001, b"hello");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);
    let handler = move |payload: &[u8]| {
        assert_eq!(payload, b"hello");
        hits_clone.fetch_add(1, Ordering::Relaxed);
    };

    metrics.packets_received.fetch_add(1, Ordering::Relaxed);
    let parsed = packet::parse(&frame, &port_map).expect("well-formed frame parses");
    metrics.record_class(parsed.flow_class);
    assert_eq!(parsed.flow_class, FlowClass::Gossip);
    handler(parsed.payload);

    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.packets_received.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.gossip_packets.load(Ordering::Relaxed), 1);
}

#[test]
fn reject_non_ipv4_counts_parse_error_without_dispatch() {
    let metrics = Arc::new(Metrics::new());
    let port_map = PortMap::default();
    let frame = synth_frame(0x86dd, 17, 8001, b"hello");

    metrics.packets_received.fetch_add(1, Ordering::Relaxed);
    match packet::parse(&frame, &port_map) {
        Ok(_) => panic!("IPv6 frame must not parse as a supported packet"),
        Err(_) => metrics.parse_errors.fetch_add(1, Ordering::Relaxed),
    }

    assert_eq!(metrics.parse_errors.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.gossip_packets.load(Ordering::Relaxed), 0);
}
