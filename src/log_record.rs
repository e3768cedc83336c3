//! The `logPacket` callback record and its small
//! byte-formatting helpers.

use std::net::IpAddr;

use crate::packet::TcpFlags;

/// Record passed to `HostCallbacks::log_packet`.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub time_ms: i64,
    pub version: u8,
    pub protocol: u8,
    pub flags: String,
    pub source: IpAddr,
    pub source_port: u16,
    pub dest: IpAddr,
    pub dest_port: u16,
    pub extra: String,
    pub owner: Option<i32>,
    pub allowed: bool,
}

/// Flags string for a TCP segment: one letter per set flag, checked in
/// S, A, P, F, R order.
pub fn tcp_flags_string(flags: TcpFlags) -> String {
    let mut s = String::with_capacity(5);
    if flags.syn {
        s.push('S');
    }
    if flags.ack {
        s.push('A');
    }
    if flags.psh {
        s.push('P');
    }
    if flags.fin {
        s.push('F');
    }
    if flags.rst {
        s.push('R');
    }
    s
}

/// Lowercase hex dump, used for diagnostic `extra` fields (e.g. the raw
/// first bytes of an unrecognised protocol).
pub fn hex_dump(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
