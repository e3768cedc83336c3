//! Timeout sweeper. Grounded on the original's periodic
//! `check_sessions()` walk, generalised to return what happened rather
//! than acting on live sockets directly, and driven by the `Clock` trait
//! so idempotence (sweeping twice in a row with no intervening activity
//! has the same effect as sweeping once) can be tested without sleeping.

use std::os::unix::io::RawFd;

use crate::clock::Clock;
use crate::config::timeouts::{
    TCP_CLOSING_TIMEOUT_SECS, TCP_ESTABLISHED_TIMEOUT_SECS, TCP_INIT_TIMEOUT_SECS, TCP_KEEP_TIMEOUT_SECS,
    UDP_TIMEOUT_53_SECS, UDP_TIMEOUT_ANY_SECS,
};
use crate::flow::{FlowKey, FlowTables, TcpState};
use crate::packet::TcpFlags;
use crate::tcp::SynthSegment;

fn udp_timeout(key: &FlowKey) -> i64 {
    if key.dst_port == 53 {
        UDP_TIMEOUT_53_SECS
    } else {
        UDP_TIMEOUT_ANY_SECS
    }
}

fn tcp_timeout(state: TcpState) -> i64 {
    match state {
        TcpState::Listen | TcpState::SynRecv => TCP_INIT_TIMEOUT_SECS,
        TcpState::Established => TCP_ESTABLISHED_TIMEOUT_SECS,
        TcpState::CloseWait | TcpState::LastAck | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing => {
            TCP_CLOSING_TIMEOUT_SECS
        }
        TcpState::TimeWait | TcpState::Close => TCP_KEEP_TIMEOUT_SECS,
    }
}

/// Run one sweep pass over both tables, in place. Returns the keys
/// evicted (sockets should be closed by the caller for each one
/// returned for `UdpEviction::Unlink` / `TcpEviction::CloseSocket` /
/// `TcpEviction::Unlink`) and the RSTs that must be written to TUN.
pub struct SweepResult {
    /// Flows removed from the table; the caller must still close each
    /// socket.
    pub udp_unlinked: Vec<(FlowKey, RawFd)>,
    /// Flows that just transitioned TIME_WAIT → CLOSE and stay in the
    /// table; the caller closes the socket but does not remove the row.
    pub tcp_closed_sockets: Vec<(FlowKey, RawFd)>,
    /// Flows removed from the table after CLOSE retention expired. Their
    /// sockets were already closed when they entered CLOSE.
    pub tcp_unlinked: Vec<FlowKey>,
    /// Flows that transitioned to TIME_WAIT because of idleness; each
    /// carries the RST the caller must write to TUN/pcap.
    pub tcp_resets: Vec<(FlowKey, SynthSegment)>,
}

pub fn sweep(tables: &mut FlowTables, clock: &dyn Clock) -> SweepResult {
    let now = clock.now_secs();
    let mut result = SweepResult {
        udp_unlinked: Vec::new(),
        tcp_closed_sockets: Vec::new(),
        tcp_unlinked: Vec::new(),
        tcp_resets: Vec::new(),
    };

    let stale_udp: Vec<(FlowKey, RawFd)> = tables
        .udp
        .iter()
        .filter(|(key, flow)| flow.stop || now - flow.last_activity >= udp_timeout(key))
        .map(|(key, flow)| (*key, flow.socket))
        .collect();
    for (key, socket) in stale_udp {
        tables.udp.remove(&key);
        result.udp_unlinked.push((key, socket));
    }

    let keys: Vec<FlowKey> = tables.tcp.keys().copied().collect();
    for key in keys {
        let flow = tables.tcp.get_mut(&key).expect("key came from this table");
        let idle = now - flow.last_activity;
        match flow.state {
            TcpState::TimeWait => {
                flow.last_activity = now;
                flow.state = TcpState::Close;
                result.tcp_closed_sockets.push((key, flow.socket));
            }
            TcpState::Close => {
                if idle >= tcp_timeout(TcpState::Close) {
                    tables.tcp.remove(&key);
                    result.tcp_unlinked.push(key);
                }
            }
            other if idle >= tcp_timeout(other) => {
                let rst = SynthSegment {
                    seq: flow.local_seq,
                    ack: flow.remote_seq,
                    flags: TcpFlags::rst_only(),
                    payload: Vec::new(),
                };
                flow.state = TcpState::TimeWait;
                result.tcp_resets.push((key, rst));
            }
            _ => {}
        }
    }

    result
}
