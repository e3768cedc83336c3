//! Packet synthesiser: builds IPv4/IPv6 + TCP/UDP packets the proxy
//! fabricates toward the originating application.
//!
//! The proxy always impersonates the remote side, so every synthesised
//! packet has source/destination swapped relative to the flow's 5-tuple.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::checksum;
use crate::config::limits::TCP_RECV_WINDOW;
use crate::packet::TcpFlags;

const TTL: u8 = 64;

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: u16) -> [u8; 20] {
    let mut h = [0u8; 20];
    h[0] = 0x45; // version 4, IHL 5
    h[1] = 0; // DSCP/ECN
    let total_len = 20u16 + payload_len;
    h[2..4].copy_from_slice(&total_len.to_be_bytes());
    h[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    h[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    h[8] = TTL;
    h[9] = protocol;
    // h[10..12] checksum filled below
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    let cksum = checksum::ipv4_header_checksum(&h);
    h[10..12].copy_from_slice(&cksum.to_be_bytes());
    h
}

fn ipv6_header(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload_len: u16) -> [u8; 40] {
    let mut h = [0u8; 40];
    h[0] = 0x60; // version 6, traffic class 0, flow label 0
    h[4..6].copy_from_slice(&payload_len.to_be_bytes());
    h[6] = next_header;
    h[7] = TTL;
    h[8..24].copy_from_slice(&src.octets());
    h[24..40].copy_from_slice(&dst.octets());
    h
}

fn tcp_header(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags, window: u16) -> [u8; 20] {
    let mut h = [0u8; 20];
    h[0..2].copy_from_slice(&src_port.to_be_bytes());
    h[2..4].copy_from_slice(&dst_port.to_be_bytes());
    h[4..8].copy_from_slice(&seq.to_be_bytes());
    let ack = if flags.ack { ack } else { 0 };
    h[8..12].copy_from_slice(&ack.to_be_bytes());
    h[12] = 5 << 4; // data offset, no options
    h[13] = flags.to_byte();
    h[14..16].copy_from_slice(&window.to_be_bytes());
    // h[16..18] checksum filled by caller
    h
}

/// Build a complete IPv4 TCP segment with a correct header and transport
/// checksum.
pub fn build_ipv4_tcp(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = tcp_header(src_port, dst_port, seq, ack, flags, TCP_RECV_WINDOW).to_vec();
    tcp.extend_from_slice(payload);
    let pseudo = checksum::pseudo_header_sum_v4(src, dst, 6, tcp.len() as u16);
    let cksum = checksum::transport_checksum(pseudo, &tcp, false);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    let mut pkt = ipv4_header(src, dst, 6, tcp.len() as u16).to_vec();
    pkt.extend_from_slice(&tcp);
    pkt
}

/// Build a complete IPv6 TCP segment.
pub fn build_ipv6_tcp(
    src: Ipv6Addr,
    src_port: u16,
    dst: Ipv6Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = tcp_header(src_port, dst_port, seq, ack, flags, TCP_RECV_WINDOW).to_vec();
    tcp.extend_from_slice(payload);
    let pseudo = checksum::pseudo_header_sum_v6(src, dst, 6, tcp.len() as u32);
    let cksum = checksum::transport_checksum(pseudo, &tcp, false);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    let mut pkt = ipv6_header(src, dst, 6, tcp.len() as u16).to_vec();
    pkt.extend_from_slice(&tcp);
    pkt
}

fn udp_header(src_port: u16, dst_port: u16, len: u16) -> [u8; 8] {
    let mut h = [0u8; 8];
    h[0..2].copy_from_slice(&src_port.to_be_bytes());
    h[2..4].copy_from_slice(&dst_port.to_be_bytes());
    h[4..6].copy_from_slice(&len.to_be_bytes());
    h
}

/// Build a complete IPv4 UDP datagram (length = payload + 8).
pub fn build_ipv4_udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8u16 + payload.len() as u16;
    let mut udp = udp_header(src_port, dst_port, udp_len).to_vec();
    udp.extend_from_slice(payload);
    let pseudo = checksum::pseudo_header_sum_v4(src, dst, 17, udp_len);
    let cksum = checksum::transport_checksum(pseudo, &udp, true);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    let mut pkt = ipv4_header(src, dst, 17, udp_len).to_vec();
    pkt.extend_from_slice(&udp);
    pkt
}

pub fn build_ipv6_udp(src: Ipv6Addr, src_port: u16, dst: Ipv6Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8u16 + payload.len() as u16;
    let mut udp = udp_header(src_port, dst_port, udp_len).to_vec();
    udp.extend_from_slice(payload);
    let pseudo = checksum::pseudo_header_sum_v6(src, dst, 17, udp_len as u32);
    let cksum = checksum::transport_checksum(pseudo, &udp, true);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    let mut pkt = ipv6_header(src, dst, 17, udp_len).to_vec();
    pkt.extend_from_slice(&udp);
    pkt
}
