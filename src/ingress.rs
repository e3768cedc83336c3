//! IP ingress parser.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::checksum;
use crate::error::{Error, Result};
use crate::packet::{IpProtocol, TcpFlags};

/// IPv6 extension header type numbers the parser walks past in search of
/// an upper-layer protocol.
const HOP_BY_HOP: u8 = 0;
const ROUTING: u8 = 43;
const FRAGMENT: u8 = 44;
const AH: u8 = 51;
const ESP: u8 = 50;
const DEST_OPTIONS: u8 = 60;
const MOBILITY: u8 = 135;

fn is_upper_layer(protocol: u8) -> bool {
    matches!(IpProtocol::from_number(protocol), IpProtocol::Tcp | IpProtocol::Udp | IpProtocol::Icmp)
}

/// A successfully parsed ingress packet: enough structure to route it to
/// the UDP translator or TCP state machine without re-parsing.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: u8,
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// True when the IPv4 "more fragments" bit was set or the fragment
    /// offset is non-zero. Fragments are flagged but otherwise processed
    /// without reassembly.
    pub fragmented: bool,
    pub payload_offset: usize,
    /// Absolute offset into the original packet where the application
    /// payload begins: the transport header start plus the transport
    /// header's own length (TCP data offset, including options; fixed 8
    /// for UDP). Use this, not `payload_offset`, to slice out payload
    /// bytes.
    pub data_start: usize,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: TcpFlags,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub tcp_window: u16,
}

/// Parse a raw IP packet read from the TUN device. `verify_ipv4_checksum`
/// mirrors the original's `loglevel < WARN` gate (only checked when
/// verbose logging is enabled).
pub fn parse_packet(pkt: &[u8], verify_ipv4_checksum: bool) -> Result<ParsedPacket> {
    if pkt.is_empty() {
        return Err(Error::PacketTooShort { need: 1, have: 0 });
    }
    let version = pkt[0] >> 4;
    match version {
        4 => parse_ipv4(pkt, verify_ipv4_checksum),
        6 => parse_ipv6(pkt),
        other => Err(Error::Protocol(format!("unknown IP version {other}"))),
    }
}

fn parse_ipv4(pkt: &[u8], verify_checksum: bool) -> Result<ParsedPacket> {
    if pkt.len() < 20 {
        return Err(Error::PacketTooShort { need: 20, have: pkt.len() });
    }
    let ihl = (pkt[0] & 0x0F) as usize * 4;
    if ihl < 20 || pkt.len() < ihl {
        return Err(Error::Protocol(format!("invalid IHL {ihl}")));
    }
    let total_len = u16::from_be_bytes([pkt[2], pkt[3]]) as usize;
    if total_len != pkt.len() {
        return Err(Error::Protocol(format!(
            "IPv4 total length {total_len} does not match captured length {}",
            pkt.len()
        )));
    }
    if verify_checksum {
        let mut header = pkt[..ihl].to_vec();
        header[10] = 0;
        header[11] = 0;
        if checksum::ipv4_header_checksum(&header) != u16::from_be_bytes([pkt[10], pkt[11]]) {
            return Err(Error::Protocol("invalid IPv4 header checksum".into()));
        }
    }
    let frag_off_and_flags = u16::from_be_bytes([pkt[6], pkt[7]]);
    let more_fragments = frag_off_and_flags & 0x2000 != 0;
    let frag_offset = frag_off_and_flags & 0x1FFF;
    let protocol = IpProtocol::from_number(pkt[9]);
    let src_ip = IpAddr::V4(Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]));

    finish(
        4,
        protocol,
        src_ip,
        dst_ip,
        more_fragments || frag_offset != 0,
        pkt,
        ihl,
    )
}

struct ExtHeaderStep {
    next_header: u8,
    total_len: usize,
}

fn generic_ext_header(data: &[u8]) -> Option<ExtHeaderStep> {
    if data.len() < 2 {
        return None;
    }
    let next_header = data[0];
    let hdr_ext_len = data[1] as usize;
    Some(ExtHeaderStep {
        next_header,
        total_len: (hdr_ext_len + 1) * 8,
    })
}

fn fragment_header(data: &[u8]) -> Option<ExtHeaderStep> {
    if data.len() < 8 {
        return None;
    }
    Some(ExtHeaderStep {
        next_header: data[0],
        total_len: 8,
    })
}

fn ah_header(data: &[u8]) -> Option<ExtHeaderStep> {
    if data.len() < 2 {
        return None;
    }
    let next_header = data[0];
    let payload_len = data[1] as usize;
    Some(ExtHeaderStep {
        next_header,
        total_len: (payload_len + 2) * 4,
    })
}

fn parse_ipv6(pkt: &[u8]) -> Result<ParsedPacket> {
    if pkt.len() < 40 {
        return Err(Error::PacketTooShort { need: 40, have: pkt.len() });
    }
    let mut protocol = pkt[6];
    let src_ip = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&pkt[8..24]).unwrap()));
    let dst_ip = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&pkt[24..40]).unwrap()));

    let mut offset = 40usize;
    let mut fragmented = false;
    // Bounded walk: an extension header chain longer than this is treated
    // the same as "no upper layer found" rather than looping indefinitely
    // on malformed input.
    for _ in 0..16 {
        if is_upper_layer(protocol) {
            return finish(6, IpProtocol::from_number(protocol), src_ip, dst_ip, fragmented, pkt, offset);
        }
        if protocol == ESP {
            // Encrypted from here on; there is no cleartext way to find
            // the next header without decrypting, so the walk stops here.
            break;
        }
        let step = match protocol {
            HOP_BY_HOP | ROUTING | DEST_OPTIONS | MOBILITY => generic_ext_header(pkt.get(offset..).unwrap_or(&[])),
            FRAGMENT => {
                fragmented = true;
                fragment_header(pkt.get(offset..).unwrap_or(&[]))
            }
            AH => ah_header(pkt.get(offset..).unwrap_or(&[])),
            _ => None,
        };
        match step {
            Some(s) if offset + s.total_len <= pkt.len() => {
                protocol = s.next_header;
                offset += s.total_len;
            }
            _ => break,
        }
    }

    Err(Error::UnsupportedProtocol(protocol))
}

fn finish(
    version: u8,
    protocol: IpProtocol,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    fragmented: bool,
    pkt: &[u8],
    payload_offset: usize,
) -> Result<ParsedPacket> {
    let payload = pkt.get(payload_offset..).unwrap_or(&[]);
    let (src_port, dst_port, tcp_flags, tcp_seq, tcp_ack, tcp_window, header_len) = match protocol {
        IpProtocol::Tcp => {
            if payload.len() < 20 {
                return Err(Error::PacketTooShort { need: 20, have: payload.len() });
            }
            let src_port = u16::from_be_bytes([payload[0], payload[1]]);
            let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
            let seq = u32::from_be_bytes(payload[4..8].try_into().unwrap());
            let ack = u32::from_be_bytes(payload[8..12].try_into().unwrap());
            let flags = TcpFlags::from_byte(payload[13]);
            let window = u16::from_be_bytes([payload[14], payload[15]]);
            let data_offset = ((payload[12] >> 4) as usize) * 4;
            if data_offset < 20 || payload.len() < data_offset {
                return Err(Error::Protocol(format!("invalid TCP data offset {data_offset}")));
            }
            (src_port, dst_port, flags, seq, ack, window, data_offset)
        }
        IpProtocol::Udp => {
            if payload.len() < 8 {
                return Err(Error::PacketTooShort { need: 8, have: payload.len() });
            }
            let src_port = u16::from_be_bytes([payload[0], payload[1]]);
            let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
            (src_port, dst_port, TcpFlags::default(), 0, 0, 0, 8)
        }
        _ => (0, 0, TcpFlags::default(), 0, 0, 0, 0),
    };

    Ok(ParsedPacket {
        version,
        protocol,
        src_ip,
        dst_ip,
        fragmented,
        payload_offset,
        data_start: payload_offset + header_len,
        src_port,
        dst_port,
        tcp_flags,
        tcp_seq,
        tcp_ack,
        tcp_window,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_tcp_packet(flags: u8) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45; // version 4, IHL 5
        let total_len = (pkt.len() as u16).to_be_bytes();
        pkt[2] = total_len[0];
        pkt[3] = total_len[1];
        pkt[9] = 6; // TCP
        pkt[12..16].copy_from_slice(&[10, 0, 0, 2]);
        pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
        pkt[20] = 0x9C; // src port 40000 high byte
        pkt[21] = 0x40;
        pkt[22] = 0x00; // dst port 80
        pkt[23] = 0x50;
        pkt[24..28].copy_from_slice(&1000u32.to_be_bytes());
        pkt[33] = flags;
        pkt[34] = 0xFF;
        pkt[35] = 0xFF; // window 65535
        pkt
    }

    #[test]
    fn parses_ipv4_tcp_syn() {
        let pkt = ipv4_tcp_packet(TcpFlags::SYN);
        let parsed = parse_packet(&pkt, false).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.protocol, IpProtocol::Tcp);
        assert_eq!(parsed.src_port, 40000);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.tcp_seq, 1000);
        assert!(parsed.tcp_flags.syn);
        assert_eq!(parsed.tcp_window, 65535);
        assert!(!parsed.fragmented);
    }

    #[test]
    fn rejects_mismatched_total_length() {
        let mut pkt = ipv4_tcp_packet(TcpFlags::SYN);
        pkt.push(0); // length field now disagrees with buffer length
        assert!(parse_packet(&pkt, false).is_err());
    }

    #[test]
    fn flags_mf_bit_marks_fragmented() {
        let mut pkt = ipv4_tcp_packet(TcpFlags::ACK);
        pkt[6] = 0x20; // MF bit set
        let parsed = parse_packet(&pkt, false).unwrap();
        assert!(parsed.fragmented);
    }

    fn ipv6_udp_packet() -> Vec<u8> {
        let mut pkt = vec![0u8; 48];
        pkt[0] = 0x60;
        pkt[6] = 17; // next header UDP
        pkt[7] = 64; // hop limit
        pkt[8..24].copy_from_slice(&[0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        pkt[24..40].copy_from_slice(&[0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        pkt[40] = 0xC3; // src port 50000
        pkt[41] = 0x50;
        pkt[42] = 0x00; // dst port 53
        pkt[43] = 0x35;
        pkt
    }

    #[test]
    fn parses_ipv6_udp_directly() {
        let pkt = ipv6_udp_packet();
        let parsed = parse_packet(&pkt, false).unwrap();
        assert_eq!(parsed.version, 6);
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.dst_port, 53);
    }

    #[test]
    fn parses_ipv6_with_hop_by_hop_extension() {
        let mut pkt = ipv6_udp_packet();
        pkt[6] = HOP_BY_HOP;
        // Insert an 8-byte hop-by-hop header whose next header is UDP.
        let mut ext = vec![17u8, 0, 0, 0, 0, 0, 0, 0];
        let tail = pkt.split_off(40);
        pkt.append(&mut ext);
        pkt.extend(tail);
        let parsed = parse_packet(&pkt, false).unwrap();
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.payload_offset, 48);
    }

    #[test]
    fn ipv6_all_extension_headers_with_no_upper_layer_is_dropped() {
        let mut pkt = ipv6_udp_packet();
        pkt[6] = ESP;
        let parsed = parse_packet(&pkt, false);
        assert!(parsed.is_err());
    }
}
