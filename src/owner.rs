//! Owner-identity resolution.
//!
//! The production lookup is a blocking scan of `/proc/net/{tcp,tcp6,udp,
//! udp6}`; that side effect is isolated behind `OwnerTable` so the
//! IPv6-then-IPv4 probe order and the retry/delay policy can be unit
//! tested against a fixed, in-memory table (grounded on
//! `router/process.rs`'s `format_proc_tcp_v4`/`format_proc_tcp_v6`, with
//! an IPv6-probe-before-IPv4-fallback retry/delay contract layered on top).

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use crate::config::timeouts::{UID_INITIAL_DELAY_MS, UID_MAXTRY, UID_RETRY_DELAY_MS};
use crate::packet::IpProtocol;

/// A source of local-endpoint → owner-identity mappings.
pub trait OwnerTable: Send + Sync {
    /// Single, un-retried probe of one protocol/address-family table.
    fn lookup(&self, protocol: IpProtocol, local: SocketAddr) -> Option<i32>;
}

/// Reads the real kernel connection tables on Linux.
pub struct ProcOwnerTable;

impl ProcOwnerTable {
    fn table_path(protocol: IpProtocol, version: u8) -> &'static str {
        match (protocol, version) {
            (IpProtocol::Tcp, 4) => "/proc/net/tcp",
            (IpProtocol::Tcp, _) => "/proc/net/tcp6",
            (IpProtocol::Udp, 4) => "/proc/net/udp",
            (IpProtocol::Udp, _) => "/proc/net/udp6",
            _ => "/proc/net/tcp",
        }
    }

    /// Little-endian hex encoding the kernel uses for IPv4 local-address
    /// columns: `"{:08X}:{:04X}"` of (addr, port).
    fn format_v4(addr: Ipv4Addr, port: u16) -> String {
        let ip = u32::from_le_bytes(addr.octets());
        format!("{:08X}:{:04X}", ip, port)
    }

    /// Same idea for IPv6: each 4-byte chunk of the address is
    /// little-endian hex, concatenated, then `:port`.
    fn format_v6(addr: Ipv6Addr, port: u16) -> String {
        let octets = addr.octets();
        let mut s = String::with_capacity(32 + 5);
        for chunk in octets.chunks_exact(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            s.push_str(&format!("{:08X}", word));
        }
        s.push_str(&format!(":{:04X}", port));
        s
    }

    fn find_owner_in_table(path: &str, needle: &str) -> Option<i32> {
        let contents = fs::read_to_string(path).ok()?;
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            if local.eq_ignore_ascii_case(needle) {
                return fields.get(7).and_then(|s| s.parse::<i32>().ok());
            }
        }
        None
    }
}

impl OwnerTable for ProcOwnerTable {
    fn lookup(&self, protocol: IpProtocol, local: SocketAddr) -> Option<i32> {
        let path = Self::table_path(protocol, if local.is_ipv4() { 4 } else { 6 });
        let needle = match local.ip() {
            IpAddr::V4(a) => Self::format_v4(a, local.port()),
            IpAddr::V6(a) => Self::format_v6(a, local.port()),
        };
        Self::find_owner_in_table(path, &needle)
    }
}

/// Layers the IPv6-then-IPv4 retry policy on top of a single-probe `OwnerTable`:
/// for IPv4 flows, first probe the IPv6 table via the IPv4-mapped address,
/// then fall back to the IPv4 table; retry up to `UID_MAXTRY` times with a
/// fixed delay, after an initial delay (the kernel table may lag a
/// just-created socket).
pub fn resolve_owner(table: &dyn OwnerTable, protocol: IpProtocol, version: u8, local: SocketAddr) -> Option<i32> {
    thread::sleep(Duration::from_millis(UID_INITIAL_DELAY_MS));
    for attempt in 0..UID_MAXTRY {
        if let Some(owner) = probe_once(table, protocol, version, local) {
            return Some(owner);
        }
        if attempt + 1 < UID_MAXTRY {
            thread::sleep(Duration::from_millis(UID_RETRY_DELAY_MS));
        }
    }
    None
}

fn probe_once(table: &dyn OwnerTable, protocol: IpProtocol, version: u8, local: SocketAddr) -> Option<i32> {
    if version == 4 {
        if let IpAddr::V4(v4) = local.ip() {
            let mapped = SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), local.port());
            if let Some(owner) = table.lookup(protocol, mapped) {
                return Some(owner);
            }
        }
    }
    table.lookup(protocol, local)
}
