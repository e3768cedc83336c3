//! TCP state machine. Grounded on `handle_tcp()` in the
//! original source: the per-segment processing order below follows that
//! function's `if (ok) { if (rst) ... else if (in-order) ... else ... }`
//! structure line for line, generalised to return a description of the
//! resulting side effects instead of acting on a live socket directly —
//! the caller performs the actual socket/TUN I/O and feeds the result
//! back in, which is what keeps this module unit-testable without a real
//! TUN device or sockets (see the reference crate's `tun_stack.rs`, which
//! draws the same line between decision and I/O).

pub mod seq;

use crate::config::limits::TCP_SEND_WINDOW;
use crate::flow::{TcpFlow, TcpState};
use crate::ingress::ParsedPacket;
use crate::packet::TcpFlags;

/// A segment this module wants synthesised toward the originating peer.
/// `payload` is empty for pure control segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthSegment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

impl SynthSegment {
    fn control(seq: u32, ack: u32, flags: TcpFlags) -> Self {
        SynthSegment { seq, ack, flags, payload: Vec::new() }
    }
}

/// What a host should do when no flow matched the segment's 5-tuple.
pub enum NoFlowAction {
    /// The segment carried SYN: the caller should open a non-blocking
    /// socket, `protect` it, start a `connect`, and insert a new
    /// `TcpFlow` in `Listen` with these parameters.
    Open { local_isn: u32, remote_isn: u32, send_window: u16 },
    /// No SYN: reject with an unsolicited RST; no flow is created.
    Reject(SynthSegment),
}

/// Decide what to do with a segment when no existing flow matched
/// (the no-flow-exists path). `local_isn` is supplied by the
/// caller (randomly chosen) since this module has no RNG dependency.
pub fn on_no_flow(seg: &ParsedPacket, local_isn: u32) -> NoFlowAction {
    if seg.tcp_flags.syn {
        NoFlowAction::Open {
            local_isn,
            remote_isn: seg.tcp_seq,
            send_window: seg.tcp_window,
        }
    } else {
        NoFlowAction::Reject(SynthSegment::control(0, seg.tcp_seq, TcpFlags::rst_only()))
    }
}

/// How an out-of-order segment (one that isn't the in-order control
/// segment) was classified, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    KeepAlive,
    Previous,
    Repeated,
    Invalid,
}

impl Classification {
    /// Whether the packet is tolerated (no state change, not a soft
    /// error) as opposed to `Invalid` (soft error, dropped).
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Classification::Invalid)
    }
}

/// Side effects of processing one inbound segment against a live flow.
#[derive(Debug, Default)]
pub struct SegmentEffects {
    pub synth: Vec<SynthSegment>,
    pub shutdown_write: bool,
    /// Set only when step 4 (out-of-order) was reached.
    pub classification: Option<Classification>,
}

/// A flow already exists and is in `Close`: synthesise RST and return,
/// using the flow's own current sequence numbers.
pub fn on_closed_flow(flow: &TcpFlow) -> SynthSegment {
    SynthSegment::control(flow.local_seq, flow.remote_seq, TcpFlags::rst_only())
}

/// Process one inbound segment against a non-`Close` flow. `forward`
/// performs the actual `send()`-to-upstream-socket call and returns
/// whether it succeeded; it
/// is only invoked when step 1 applies. `now` updates `last_activity`.
pub fn process_segment<F>(
    flow: &mut TcpFlow,
    seg: &ParsedPacket,
    payload_len: usize,
    now: i64,
    forward: F,
) -> SegmentEffects
where
    F: FnOnce(bool) -> bool,
{
    flow.last_activity = now;
    flow.send_window = seg.tcp_window;

    let mut effects = SegmentEffects::default();

    // Step 1: payload delivery.
    if seg.tcp_seq == flow.remote_seq && payload_len > 0 {
        if !forward(seg.tcp_flags.psh) {
            flow.state = TcpState::Close;
            effects.synth.push(SynthSegment::control(flow.local_seq, flow.remote_seq, TcpFlags::rst_only()));
            return effects;
        }
        let defer_ack = seg.tcp_flags.fin
            || matches!(flow.state, TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing);
        flow.remote_seq = flow.remote_seq.wrapping_add(payload_len as u32);
        if !defer_ack {
            effects.synth.push(SynthSegment::control(flow.local_seq, flow.remote_seq, TcpFlags::ack_only()));
        }
    }

    // Step 2: RST, no sequence check (matches the original's comment).
    if seg.tcp_flags.rst {
        flow.state = TcpState::TimeWait;
        return effects;
    }

    // Step 3: in-order control segment, checked against the (possibly
    // step-1-advanced) remote_seq.
    if seg.tcp_ack == flow.local_seq && seg.tcp_seq == flow.remote_seq {
        if seg.tcp_flags.syn {
            // Duplicate SYN: socket is likely already opening. Ignored.
        } else if seg.tcp_flags.fin {
            effects.shutdown_write = true;
            flow.remote_seq = flow.remote_seq.wrapping_add(1);
            effects.synth.push(SynthSegment::control(flow.local_seq, flow.remote_seq, TcpFlags::ack_only()));
            flow.state = match flow.state {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 if seg.tcp_flags.ack => TcpState::TimeWait,
                TcpState::FinWait1 => TcpState::Closing,
                TcpState::FinWait2 => TcpState::TimeWait,
                other => other,
            };
        } else if seg.tcp_flags.ack {
            flow.state = match flow.state {
                TcpState::SynRecv => TcpState::Established,
                TcpState::Established => TcpState::Established,
                TcpState::LastAck => TcpState::TimeWait,
                TcpState::FinWait1 => TcpState::FinWait2,
                TcpState::Closing => TcpState::TimeWait,
                other => other,
            };
        }
        // A segment with none of SYN/FIN/ACK set in-order is an "unknown
        // packet" in the original and is silently dropped (soft error).
    } else {
        // Step 4: out-of-order classification.
        let classification = if seg.tcp_flags.ack && seg.tcp_seq.wrapping_add(1) == flow.remote_seq {
            Classification::KeepAlive
        } else if seg.tcp_seq == flow.remote_seq && seq::lt(seg.tcp_ack, flow.local_seq) {
            Classification::Previous
        } else if seq::lt(seg.tcp_seq, flow.remote_seq) && seg.tcp_ack == flow.local_seq {
            Classification::Repeated
        } else {
            Classification::Invalid
        };
        effects.classification = Some(classification);
    }

    effects
}

/// Socket-side event: the flow's socket raised an exception condition
/// (the socket-side-events path).
pub fn on_socket_exception(flow: &mut TcpFlow) -> SynthSegment {
    flow.state = TcpState::TimeWait;
    SynthSegment::control(flow.local_seq, flow.remote_seq, TcpFlags::rst_only())
}

/// Socket-side event: a `Listen` flow's connect completed (socket became
/// writable). Synthesises the SYN+ACK and transitions to `SynRecv`.
pub fn on_connect_complete(flow: &mut TcpFlow) -> SynthSegment {
    let synth = SynthSegment::control(
        flow.local_isn,
        flow.remote_seq.wrapping_add(1),
        TcpFlags::syn_ack(),
    );
    flow.local_seq = flow.local_isn.wrapping_add(1);
    flow.remote_seq = flow.remote_seq.wrapping_add(1);
    flow.state = TcpState::SynRecv;
    synth
}

/// Upper bound on one `read()` from an upstream socket:
/// `min(send_window, TCP_SEND_WINDOW)`.
pub fn read_limit(flow: &TcpFlow) -> usize {
    (flow.send_window as usize).min(TCP_SEND_WINDOW)
}

/// Socket-side event: the upstream socket became readable while the flow
/// is in `SynRecv`, `Established`, or `CloseWait`. `data` is what was
/// actually read (empty means EOF).
pub fn on_readable(flow: &mut TcpFlow, data: &[u8]) -> SynthSegment {
    if data.is_empty() {
        let segment = SynthSegment::control(flow.local_seq, flow.remote_seq, TcpFlags::fin_ack());
        flow.local_seq = flow.local_seq.wrapping_add(1);
        flow.state = match flow.state {
            TcpState::Established | TcpState::SynRecv => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            other => other,
        };
        segment
    } else {
        let segment = SynthSegment {
            seq: flow.local_seq,
            ack: flow.remote_seq,
            flags: TcpFlags::ack_only(),
            payload: data.to_vec(),
        };
        flow.local_seq = flow.local_seq.wrapping_add(data.len() as u32);
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn seg(seq: u32, ack: u32, flags: TcpFlags, window: u16) -> ParsedPacket {
        ParsedPacket {
            version: 4,
            protocol: crate::packet::IpProtocol::Tcp,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            fragmented: false,
            payload_offset: 20,
            data_start: 40,
            src_port: 40000,
            dst_port: 80,
            tcp_flags: flags,
            tcp_seq: seq,
            tcp_ack: ack,
            tcp_window: window,
        }
    }

    fn flow(state: TcpState, local_isn: u32, local_seq: u32, remote_isn: u32, remote_seq: u32) -> TcpFlow {
        TcpFlow {
            key: crate::flow::FlowKey::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                40000,
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                80,
            ),
            state,
            local_isn,
            local_seq,
            remote_isn,
            remote_seq,
            send_window: 65535,
            socket: -1,
            last_activity: 0,
            owner: None,
            seq: 0,
        }
    }

    #[test]
    fn no_flow_with_syn_opens_a_listen_flow() {
        let s = seg(1000, 0, TcpFlags { syn: true, ..Default::default() }, 65535);
        match on_no_flow(&s, 7777) {
            NoFlowAction::Open { local_isn, remote_isn, send_window } => {
                assert_eq!(local_isn, 7777);
                assert_eq!(remote_isn, 1000);
                assert_eq!(send_window, 65535);
            }
            NoFlowAction::Reject(_) => panic!("expected Open"),
        }
    }

    #[test]
    fn no_flow_without_syn_rejects_with_rst() {
        let s = seg(1000, 0, TcpFlags::ack_only(), 65535);
        match on_no_flow(&s, 7777) {
            NoFlowAction::Reject(rst) => {
                assert_eq!(rst.seq, 0);
                assert_eq!(rst.ack, 1000);
                assert!(rst.flags.rst);
            }
            NoFlowAction::Open { .. } => panic!("expected Reject"),
        }
    }

    #[test]
    fn connect_complete_synthesises_syn_ack_and_advances_both_sequences() {
        let mut f = flow(TcpState::Listen, 7777, 7777, 1000, 1000);
        let synth = on_connect_complete(&mut f);
        assert_eq!(synth.seq, 7777);
        assert_eq!(synth.ack, 1001);
        assert_eq!(synth.flags, TcpFlags::syn_ack());
        assert_eq!(f.local_seq, 7778);
        assert_eq!(f.remote_seq, 1001);
        assert_eq!(f.state, TcpState::SynRecv);
    }

    #[test]
    fn established_ack_with_data_forwards_and_acks() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags::ack_only(), 65535);
        let mut forwarded = None;
        let effects = process_segment(&mut f, &s, 5, 42, |psh| {
            forwarded = Some(psh);
            true
        });
        assert_eq!(forwarded, Some(false));
        assert_eq!(f.remote_seq, 1006);
        assert_eq!(f.last_activity, 42);
        assert_eq!(effects.synth.len(), 1);
        assert_eq!(effects.synth[0].flags, TcpFlags::ack_only());
        assert_eq!(effects.synth[0].ack, 1006);
    }

    #[test]
    fn forward_send_failure_resets_and_closes() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags::ack_only(), 65535);
        let effects = process_segment(&mut f, &s, 5, 42, |_| false);
        assert_eq!(f.state, TcpState::Close);
        assert_eq!(effects.synth.len(), 1);
        assert!(effects.synth[0].flags.rst);
    }

    #[test]
    fn inbound_rst_transitions_to_time_wait_with_no_synth() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags { rst: true, ..Default::default() }, 65535);
        let effects = process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::TimeWait);
        assert!(effects.synth.is_empty());
    }

    #[test]
    fn fin_in_established_moves_to_close_wait_and_acks() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags { fin: true, ack: true, ..Default::default() }, 65535);
        let effects = process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::CloseWait);
        assert!(effects.shutdown_write);
        assert_eq!(f.remote_seq, 1002);
        assert_eq!(effects.synth[0].ack, 1002);
    }

    #[test]
    fn fin_in_fin_wait1_without_ack_goes_to_closing() {
        let mut f = flow(TcpState::FinWait1, 7778, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags { fin: true, ..Default::default() }, 65535);
        process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::Closing);
    }

    #[test]
    fn fin_in_fin_wait1_with_ack_goes_to_time_wait() {
        let mut f = flow(TcpState::FinWait1, 7778, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags { fin: true, ack: true, ..Default::default() }, 65535);
        process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::TimeWait);
    }

    #[test]
    fn syn_recv_to_established_on_bare_ack() {
        let mut f = flow(TcpState::SynRecv, 7777, 7778, 1000, 1001);
        let s = seg(1001, 7778, TcpFlags::ack_only(), 65535);
        process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::Established);
    }

    #[test]
    fn last_ack_to_time_wait_on_ack() {
        let mut f = flow(TcpState::LastAck, 7777, 7779, 1000, 1002);
        let s = seg(1002, 7779, TcpFlags::ack_only(), 65535);
        process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::TimeWait);
    }

    #[test]
    fn closing_to_time_wait_on_ack() {
        let mut f = flow(TcpState::Closing, 7777, 7779, 1000, 1002);
        let s = seg(1002, 7779, TcpFlags::ack_only(), 65535);
        process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(f.state, TcpState::TimeWait);
    }

    #[test]
    fn out_of_order_keep_alive_is_tolerated_without_state_change() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let s = seg(1000, 7778, TcpFlags::ack_only(), 65535);
        let effects = process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(effects.classification, Some(Classification::KeepAlive));
        assert!(effects.classification.unwrap().is_allowed());
        assert_eq!(f.state, TcpState::Established);
    }

    #[test]
    fn out_of_order_repeated_uses_wrap_aware_comparison() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        // seq one before remote_seq (repeated retransmit), current ack.
        let s = seg(1000, 7778, TcpFlags::default(), 65535);
        let effects = process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(effects.classification, Some(Classification::Repeated));
    }

    #[test]
    fn out_of_order_invalid_is_not_allowed() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let s = seg(5000, 5000, TcpFlags::default(), 65535);
        let effects = process_segment(&mut f, &s, 0, 0, |_| true);
        assert_eq!(effects.classification, Some(Classification::Invalid));
        assert!(!effects.classification.unwrap().is_allowed());
    }

    #[test]
    fn closed_flow_rst_uses_current_sequence_numbers() {
        let f = flow(TcpState::Close, 7777, 7800, 1000, 1050);
        let rst = on_closed_flow(&f);
        assert_eq!(rst.seq, 7800);
        assert_eq!(rst.ack, 1050);
        assert!(rst.flags.rst);
    }

    #[test]
    fn readable_eof_sends_fin_ack_and_moves_established_to_fin_wait1() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let synth = on_readable(&mut f, &[]);
        assert_eq!(synth.flags, TcpFlags::fin_ack());
        assert_eq!(f.local_seq, 7779);
        assert_eq!(f.state, TcpState::FinWait1);
    }

    #[test]
    fn readable_eof_in_close_wait_moves_to_last_ack() {
        let mut f = flow(TcpState::CloseWait, 7777, 7778, 1000, 1001);
        on_readable(&mut f, &[]);
        assert_eq!(f.state, TcpState::LastAck);
    }

    #[test]
    fn readable_data_advances_local_seq_and_carries_payload() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        let synth = on_readable(&mut f, b"hello");
        assert_eq!(synth.payload, b"hello");
        assert_eq!(f.local_seq, 7783);
    }

    #[test]
    fn read_limit_caps_at_tcp_send_window() {
        let mut f = flow(TcpState::Established, 7777, 7778, 1000, 1001);
        f.send_window = u16::MAX;
        assert_eq!(read_limit(&f), TCP_SEND_WINDOW);
        f.send_window = 100;
        assert_eq!(read_limit(&f), 100);
    }
}
