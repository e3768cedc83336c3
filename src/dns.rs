//! DNS query parser and sinkhole response synthesiser. Grounded on the
//! original `get_dns()`/`check_domain()` and the reference crate's
//! `dns_hijack.rs`, corrected where they differ: both QTYPE and QCLASS are
//! extracted,
//! and the synthesised response clears every reserved flag bit instead of
//! setting RD/RA.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::limits::DNS_QNAME_MAX;
use crate::config::timeouts::DNS_TTL_SECS;

pub const QCLASS_IN: u16 = 1;
pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;

#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Byte length of the header + question section in the original
    /// message (everything the response copies verbatim).
    pub question_len: usize,
}

/// Parse a standard DNS query (RFC 1035 §4.1, no compression permitted in
/// a query). Returns `None` for anything that isn't a well-formed,
/// single-question standard query.
pub fn parse_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < 13 {
        return None;
    }
    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qr = (flags >> 15) & 1;
    let opcode = (flags >> 11) & 0x0F;
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qr != 0 || opcode != 0 || qdcount == 0 {
        return None;
    }

    let mut name = String::new();
    let mut offset = 12usize;
    let mut labels = 0;
    loop {
        if labels >= 10 || offset >= data.len() {
            return None;
        }
        let len = data[offset] as usize;
        if len & 0xC0 != 0 {
            // Compression pointer in a query is invalid.
            return None;
        }
        if len == 0 {
            offset += 1;
            break;
        }
        if offset + 1 + len > data.len() || name.len() + len + 1 > DNS_QNAME_MAX {
            return None;
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(std::str::from_utf8(&data[offset + 1..offset + 1 + len]).ok()?);
        offset += 1 + len;
        labels += 1;
    }

    if name.is_empty() || offset + 4 != data.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let qclass = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);

    Some(DnsQuery {
        id,
        name,
        qtype,
        qclass,
        question_len: offset + 4,
    })
}

/// Whether a query matches one of the blocklisted names and can be
/// answered with a sinkhole response (exact,
/// case-sensitive comparison; class IN; type A or AAAA).
pub fn is_blocked(query: &DnsQuery, blocklist: &std::collections::HashSet<String>) -> bool {
    query.qclass == QCLASS_IN
        && (query.qtype == QTYPE_A || query.qtype == QTYPE_AAAA)
        && blocklist.contains(&query.name)
}

/// Build a sinkhole response: the original header+question copied
/// verbatim except for the flags word, plus one answer RR pointing at the
/// loopback address.
pub fn build_sinkhole_response(original: &[u8], query: &DnsQuery) -> Vec<u8> {
    let mut out = original[..query.question_len].to_vec();
    // QR=1; opcode/AA/TC/RD/RA/Z/AD/CD/RCODE all cleared.
    out[2] = 0x80;
    out[3] = 0x00;
    // ANCOUNT = 1.
    out[6] = 0x00;
    out[7] = 0x01;

    // Pointer to the question's QNAME at offset 12.
    out.extend_from_slice(&0xC00Cu16.to_be_bytes());
    out.extend_from_slice(&query.qtype.to_be_bytes());
    out.extend_from_slice(&query.qclass.to_be_bytes());
    out.extend_from_slice(&DNS_TTL_SECS.to_be_bytes());

    if query.qtype == QTYPE_AAAA {
        out.extend_from_slice(&16u16.to_be_bytes());
        out.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
    } else {
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
    }

    out
}

pub fn loopback_for(version: u8) -> IpAddr {
    if version == 4 {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut msg = vec![0u8; 12];
        msg[0..2].copy_from_slice(&id.to_be_bytes());
        // flags all zero: standard query.
        msg[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT=1
        for label in name.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&QCLASS_IN.to_be_bytes());
        msg
    }

    #[test]
    fn parses_a_query() {
        let msg = build_query(0x1234, "ads.example", QTYPE_A);
        let q = parse_query(&msg).unwrap();
        assert_eq!(q.id, 0x1234);
        assert_eq!(q.name, "ads.example");
        assert_eq!(q.qtype, QTYPE_A);
        assert_eq!(q.qclass, QCLASS_IN);
        assert_eq!(q.question_len, msg.len());
    }

    #[test]
    fn rejects_response_flagged_packet() {
        let mut msg = build_query(1, "example.com", QTYPE_A);
        msg[2] = 0x80; // QR=1
        assert!(parse_query(&msg).is_none());
    }

    #[test]
    fn rejects_zero_qdcount() {
        let mut msg = build_query(1, "example.com", QTYPE_A);
        msg[4] = 0;
        msg[5] = 0;
        assert!(parse_query(&msg).is_none());
    }

    #[test]
    fn rejects_compression_pointer_in_query() {
        let mut msg = build_query(1, "example.com", QTYPE_A);
        msg[12] = 0xC0; // top two bits set: compression pointer
        assert!(parse_query(&msg).is_none());
    }

    #[test]
    fn too_short_is_rejected() {
        assert!(parse_query(&[0u8; 5]).is_none());
    }

    #[test]
    fn blocklist_match_requires_class_in_and_type_a_or_aaaa() {
        let mut blocklist = HashSet::new();
        blocklist.insert("ads.example".to_string());
        let msg = build_query(1, "ads.example", QTYPE_A);
        let q = parse_query(&msg).unwrap();
        assert!(is_blocked(&q, &blocklist));

        let other = build_query(1, "clean.example", QTYPE_A);
        let q2 = parse_query(&other).unwrap();
        assert!(!is_blocked(&q2, &blocklist));
    }

    #[test]
    fn sinkhole_response_round_trips_answer_fields() {
        let msg = build_query(0x1234, "example.com", QTYPE_A);
        let query = parse_query(&msg).unwrap();
        let response = build_sinkhole_response(&msg, &query);

        // ANCOUNT
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
        // QR bit set, everything else cleared.
        assert_eq!(response[2], 0x80);
        assert_eq!(response[3], 0x00);

        let answer = &response[query.question_len..];
        assert_eq!(u16::from_be_bytes([answer[0], answer[1]]), 0xC00C);
        assert_eq!(u16::from_be_bytes([answer[2], answer[3]]), QTYPE_A);
        let rdlength = u16::from_be_bytes([answer[10], answer[11]]);
        assert_eq!(rdlength, 4);
        assert_eq!(&answer[12..16], &Ipv4Addr::LOCALHOST.octets());
    }
}
