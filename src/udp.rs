//! UDP translator. Grounded on `handle_udp()`/the DNS
//! hijack branch of the original source. Flow creation (opening the
//! datagram socket, `protect`ing it, enabling broadcast) and the actual
//! `sendto()` are the engine's job since they touch a live socket; this
//! module holds the pure decisions: whether a freshly-created socket
//! needs `SO_BROADCAST`, and what should happen to one datagram once a
//! flow (new or existing) is ready to receive it.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use crate::dns;

/// True for the IPv4 limited-broadcast address. IPv6 has no broadcast
/// address, so this is always false for v6.
pub fn needs_broadcast(dst: IpAddr) -> bool {
    matches!(dst, IpAddr::V4(addr) if addr == Ipv4Addr::new(255, 255, 255, 255))
}

/// Outcome of evaluating a port-53 datagram against the blocklist.
enum DnsEvaluation {
    Blocked(Vec<u8>),
    PassThrough,
}

fn evaluate_dns(payload: &[u8], blocklist: &HashSet<String>) -> DnsEvaluation {
    match dns::parse_query(payload) {
        Some(query) if dns::is_blocked(&query, blocklist) => {
            DnsEvaluation::Blocked(dns::build_sinkhole_response(payload, &query))
        }
        _ => DnsEvaluation::PassThrough,
    }
}

/// What to do with one allowed, already-routed UDP datagram.
pub struct Delivery {
    /// Send the original payload on to the true destination.
    pub forward_payload: bool,
    /// A synthesised reply to deliver back to the originator
    /// (the DNS sinkhole response).
    pub reply: Option<Vec<u8>>,
    /// Mark the flow `stop` once this datagram has been handled.
    pub stop_after: bool,
}

/// Decide the fate of one datagram bound for `dst_port`. Non-DNS traffic
/// is always forwarded and never ends the flow's life early; port 53 is
/// either sinkholed (blocked name) or forwarded and then retired, since
/// responses on that flow are one-shot.
pub fn handle_datagram(dst_port: u16, payload: &[u8], blocklist: &HashSet<String>) -> Delivery {
    if dst_port != 53 {
        return Delivery { forward_payload: true, reply: None, stop_after: false };
    }
    match evaluate_dns(payload, blocklist) {
        DnsEvaluation::Blocked(response) => Delivery {
            forward_payload: false,
            reply: Some(response),
            stop_after: true,
        },
        DnsEvaluation::PassThrough => Delivery {
            forward_payload: true,
            reply: None,
            stop_after: true,
        },
    }
}
