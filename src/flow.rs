//! Session tables: the 5-tuple-keyed UDP and TCP flow maps.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;

/// A flow's 5-tuple identity: IP version plus the four endpoint fields. Both
/// `UdpFlow` and `TcpFlow` are keyed by this type, ordered so iteration
/// (sweeping, logging) is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub version: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        let version = if src_ip.is_ipv4() { 4 } else { 6 };
        FlowKey {
            version,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }
}

/// A UDP flow. Identity is immutable once created.
pub struct UdpFlow {
    pub key: FlowKey,
    pub owner: Option<i32>,
    pub last_activity: i64,
    pub socket: RawFd,
    /// Once set, the flow stops participating in reads and is reaped on the
    /// next sweep.
    pub stop: bool,
    pub seq: u64,
}

impl UdpFlow {
    pub fn is_dns(&self) -> bool {
        self.key.dst_port == 53
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynRecv,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    Close,
}

impl TcpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TcpState::TimeWait | TcpState::Close)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
        }
    }
}

/// A TCP flow. `local_seq`/`remote_seq` count bytes (plus 1 per SYN/FIN)
/// synthesised toward / consumed from the originator respectively
/// (identity is immutable once created).
pub struct TcpFlow {
    pub key: FlowKey,
    pub state: TcpState,
    pub local_isn: u32,
    pub local_seq: u32,
    pub remote_isn: u32,
    pub remote_seq: u32,
    pub send_window: u16,
    pub socket: RawFd,
    pub last_activity: i64,
    pub owner: Option<i32>,
    pub seq: u64,
}

impl TcpFlow {
    pub fn bytes_sent(&self) -> u32 {
        self.local_seq.wrapping_sub(self.local_isn)
    }

    pub fn bytes_received(&self) -> u32 {
        self.remote_seq.wrapping_sub(self.remote_isn)
    }
}

/// Monotonically increasing insertion counter so tables can be walked in
/// creation order when that's useful for determinism (insertion order is
/// preserved).
#[derive(Default)]
pub struct SeqCounter(u64);

impl SeqCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// The two session tables plus the insertion sequencer, grouped so the
/// engine can guard them with a single mutex.
#[derive(Default)]
pub struct FlowTables {
    pub udp: BTreeMap<FlowKey, UdpFlow>,
    pub tcp: BTreeMap<FlowKey, TcpFlow>,
    seq: SeqCounter,
}

impl FlowTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq.next()
    }
}
