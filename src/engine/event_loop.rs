//! The worker's per-iteration logic. Grounded
//! on the original's single `pselect`-driven loop: sweep, build
//! descriptor sets, wait, then handle TUN/UDP/TCP under the lock, in
//! that fixed order.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::callbacks::HostCallbacks;
use crate::clock::Clock;
use crate::config::limits::TUN_MAXMSG;
use crate::config::timeouts::SELECT_TIMEOUT_SECS;
use crate::config::EngineConfig;
use crate::flow::{FlowKey, FlowTables, TcpFlow, TcpState, UdpFlow};
use crate::ingress::{self, ParsedPacket};
use crate::log_record::{tcp_flags_string, PacketRecord};
use crate::owner::{self, OwnerTable};
use crate::packet::{IpProtocol, TcpFlags};
use crate::pcap::PcapWriter;
use crate::sweep;
use crate::synth;
use crate::tcp::{self, SynthSegment};
use crate::udp;

use super::fdset::FdSet;
use super::signal;
use super::socket;
use super::EngineState;

/// Everything a worker iteration needs that doesn't live in the shared,
/// mutex-guarded `EngineState` (config and callbacks are read-only /
/// externally synchronised, not part of the guarded state).
pub struct Worker {
    pub config: EngineConfig,
    pub callbacks: Arc<dyn HostCallbacks>,
    pub owner_table: Arc<dyn OwnerTable>,
    pub clock: Arc<dyn Clock>,
    pub blocklist: HashSet<String>,
    pub allowed: Arc<Mutex<HashSet<i32>>>,
}

/// Runs until `stopping` is observed or a fatal
/// condition on the TUN descriptor occurs.
pub fn run(worker: Worker, state: Arc<Mutex<EngineState>>, stopping: Arc<AtomicBool>) {
    let sigmask = signal::install();
    let mut fatal: Option<String> = None;

    loop {
        {
            let mut guard = state.lock().unwrap();
            let EngineState { tables, pcap } = &mut *guard;
            run_sweep(&worker, tables, pcap);
        }

        if stopping.load(Ordering::SeqCst) {
            break;
        }

        let (max_fd, mut rset, mut wset, mut eset) = {
            let guard = state.lock().unwrap();
            build_fd_sets(&worker, &guard.tables)
        };

        match wait_for_readiness(max_fd, &mut rset, &mut wset, &mut eset, &sigmask) {
            Ok(n) if n > 0 => {
                let allowed = worker.allowed.lock().unwrap().clone();
                let mut guard = state.lock().unwrap();
                let EngineState { tables, pcap } = &mut *guard;

                if eset.is_set(worker.config.tun_fd) {
                    fatal = Some("tun descriptor raised an exception condition".into());
                    break;
                }
                if rset.is_set(worker.config.tun_fd) {
                    if let Err(e) = read_tun_packet(&worker, tables, pcap, &allowed) {
                        fatal = Some(e);
                        break;
                    }
                }
                handle_udp_sockets(&worker, tables, pcap, &rset, &eset);
                handle_tcp_sockets(&worker, tables, pcap, &rset, &wset, &eset);
            }
            Ok(_) => {
                // Timed out with nothing ready; loop back to the sweeper.
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if signal::was_signaled() {
                    signal::clear();
                }
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                // Otherwise a foreign signal interrupted the wait; retry.
            }
            Err(e) => {
                fatal = Some(format!("select error: {e}"));
                break;
            }
        }
    }

    {
        let mut guard = state.lock().unwrap();
        teardown(&mut guard);
    }

    info!("sinkhole worker exiting");
    worker.callbacks.native_exit(fatal.as_deref());
}

fn run_sweep(worker: &Worker, tables: &mut FlowTables, pcap: &mut Option<PcapWriter>) {
    let result = sweep::sweep(tables, worker.clock.as_ref());
    for (_key, fd) in &result.udp_unlinked {
        socket::close(*fd);
    }
    for (_key, fd) in &result.tcp_closed_sockets {
        socket::close(*fd);
    }
    for (key, seg) in &result.tcp_resets {
        if let Some(flow) = tables.tcp.get(key) {
            let packet = build_tcp_packet(flow, seg);
            emit(worker.config.tun_fd, pcap, &packet);
        }
    }
}

fn build_fd_sets(worker: &Worker, tables: &FlowTables) -> (RawFd, FdSet, FdSet, FdSet) {
    let mut rset = FdSet::empty();
    let mut wset = FdSet::empty();
    let mut eset = FdSet::empty();
    let mut max_fd = worker.config.tun_fd;

    rset.set(worker.config.tun_fd);
    eset.set(worker.config.tun_fd);

    for flow in tables.udp.values() {
        if flow.stop {
            continue;
        }
        rset.set(flow.socket);
        eset.set(flow.socket);
        max_fd = max_fd.max(flow.socket);
    }

    for flow in tables.tcp.values() {
        match flow.state {
            TcpState::Listen => {
                wset.set(flow.socket);
                eset.set(flow.socket);
                max_fd = max_fd.max(flow.socket);
            }
            TcpState::SynRecv | TcpState::Established | TcpState::CloseWait => {
                eset.set(flow.socket);
                if flow.send_window > 0 {
                    rset.set(flow.socket);
                }
                max_fd = max_fd.max(flow.socket);
            }
            _ => {}
        }
    }

    (max_fd, rset, wset, eset)
}

fn wait_for_readiness(
    max_fd: RawFd,
    rset: &mut FdSet,
    wset: &mut FdSet,
    eset: &mut FdSet,
    sigmask: &libc::sigset_t,
) -> io::Result<i32> {
    let timeout = libc::timespec {
        tv_sec: SELECT_TIMEOUT_SECS,
        tv_nsec: 0,
    };
    let ret = unsafe {
        libc::pselect(
            max_fd + 1,
            rset.as_mut_ptr(),
            wset.as_mut_ptr(),
            eset.as_mut_ptr(),
            &timeout,
            sigmask,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn teardown(state: &mut EngineState) {
    for flow in state.tables.udp.values() {
        socket::close(flow.socket);
    }
    for flow in state.tables.tcp.values() {
        socket::close(flow.socket);
    }
    state.tables.udp.clear();
    state.tables.tcp.clear();
}

// --- TUN ingress -----------------------------------------------------

fn read_tun_packet(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    allowed: &HashSet<i32>,
) -> Result<(), String> {
    let mut buf = vec![0u8; TUN_MAXMSG];
    match socket::tun_read(worker.config.tun_fd, &mut buf) {
        Ok(0) => Err("tun descriptor reached end-of-file".into()),
        Ok(n) => {
            let data = &buf[..n];
            capture_ingress(pcap, data);
            match ingress::parse_packet(data, worker.config.debug) {
                Ok(parsed) => dispatch_packet(worker, tables, pcap, allowed, &parsed, data),
                Err(e) => debug!(error = %e, "dropping unparseable ingress packet"),
            }
            Ok(())
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(()),
        Err(e) => Err(format!("tun read error: {e}")),
    }
}

fn dispatch_packet(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    allowed: &HashSet<i32>,
    parsed: &ParsedPacket,
    raw: &[u8],
) {
    match parsed.protocol {
        IpProtocol::Udp => handle_udp_ingress(worker, tables, pcap, allowed, parsed, raw),
        IpProtocol::Tcp => handle_tcp_ingress(worker, tables, pcap, allowed, parsed, raw),
        IpProtocol::Icmp => log_packet(worker, parsed, None, true, "icmp"),
        IpProtocol::Other(n) => log_packet(worker, parsed, None, false, &format!("proto {n}")),
    }
}

// --- UDP ---------------------------------------------------------------

fn handle_udp_ingress(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    allowed: &HashSet<i32>,
    parsed: &ParsedPacket,
    raw: &[u8],
) {
    let key = FlowKey::new(parsed.src_ip, parsed.src_port, parsed.dst_ip, parsed.dst_port);
    let payload = &raw[parsed.data_start.min(raw.len())..];

    if tables.udp.contains_key(&key) {
        if matches!(tables.udp.get(&key), Some(flow) if !flow.stop) {
            deliver_udp(worker, tables, pcap, &key, payload);
        }
        return;
    }

    let local = SocketAddr::new(parsed.src_ip, parsed.src_port);
    let resolved_owner = owner::resolve_owner(worker.owner_table.as_ref(), IpProtocol::Udp, parsed.version, local);
    let allow = !worker.config.filter || resolved_owner.is_some_and(|o| allowed.contains(&o));
    log_packet(worker, parsed, resolved_owner, allow, "");
    if !allow {
        return;
    }

    let fd = match socket::open_udp(parsed.version) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(error = %e, "failed to open upstream udp socket");
            return;
        }
    };
    if !worker.callbacks.protect(fd) {
        warn!("host declined to protect udp socket");
    }
    if udp::needs_broadcast(parsed.dst_ip) {
        if let Err(e) = socket::set_broadcast(fd) {
            warn!(error = %e, "failed to enable SO_BROADCAST");
        }
    }

    tables.udp.insert(
        key,
        UdpFlow {
            key,
            owner: resolved_owner,
            last_activity: worker.clock.now_secs(),
            socket: fd,
            stop: false,
            seq: tables.next_seq(),
        },
    );

    deliver_udp(worker, tables, pcap, &key, payload);
}

/// Send `payload` on toward the true destination and act on the
/// blocklist decision.
fn deliver_udp(worker: &Worker, tables: &mut FlowTables, pcap: &mut Option<PcapWriter>, key: &FlowKey, payload: &[u8]) {
    let delivery = udp::handle_datagram(key.dst_port, payload, &worker.blocklist);

    if delivery.forward_payload {
        let dst = SocketAddr::new(key.dst_ip, key.dst_port);
        let fd = match tables.udp.get(key) {
            Some(flow) => flow.socket,
            None => return,
        };
        if let Err(e) = socket::send_to(fd, payload, dst) {
            warn!(error = %e, "udp send failed");
            if let Some(flow) = tables.udp.get_mut(key) {
                flow.stop = true;
            }
            return;
        }
    }

    if let Some(reply) = &delivery.reply {
        let packet = build_udp_reply(key, reply);
        emit(worker.config.tun_fd, pcap, &packet);
    }

    if let Some(flow) = tables.udp.get_mut(key) {
        flow.last_activity = worker.clock.now_secs();
        if delivery.stop_after {
            flow.stop = true;
        }
    }
}

fn handle_udp_sockets(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    rset: &FdSet,
    eset: &FdSet,
) {
    let keys: Vec<FlowKey> = tables.udp.keys().copied().collect();
    for key in keys {
        let fd = match tables.udp.get(&key) {
            Some(flow) if !flow.stop => flow.socket,
            _ => continue,
        };
        if eset.is_set(fd) {
            if let Some(flow) = tables.udp.get_mut(&key) {
                flow.stop = true;
            }
            continue;
        }
        if !rset.is_set(fd) {
            continue;
        }
        let mut buf = vec![0u8; 65536];
        match socket::recv(fd, &mut buf) {
            Ok(n) => {
                let packet = build_udp_reply(&key, &buf[..n]);
                emit(worker.config.tun_fd, pcap, &packet);
                if let Some(flow) = tables.udp.get_mut(&key) {
                    flow.last_activity = worker.clock.now_secs();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "udp recv failed");
                if let Some(flow) = tables.udp.get_mut(&key) {
                    flow.stop = true;
                }
            }
        }
    }
}

fn build_udp_reply(key: &FlowKey, payload: &[u8]) -> Vec<u8> {
    match (key.dst_ip, key.src_ip) {
        (IpAddr::V4(remote), IpAddr::V4(local)) => {
            synth::build_ipv4_udp(remote, key.dst_port, local, key.src_port, payload)
        }
        (IpAddr::V6(remote), IpAddr::V6(local)) => {
            synth::build_ipv6_udp(remote, key.dst_port, local, key.src_port, payload)
        }
        _ => Vec::new(),
    }
}

// --- TCP -----------------------------------------------------------------

fn handle_tcp_ingress(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    allowed: &HashSet<i32>,
    parsed: &ParsedPacket,
    raw: &[u8],
) {
    let key = FlowKey::new(parsed.src_ip, parsed.src_port, parsed.dst_ip, parsed.dst_port);
    let payload_len = raw.len().saturating_sub(parsed.data_start);

    match tables.tcp.get(&key).map(|f| f.state) {
        None => handle_tcp_no_flow(worker, tables, pcap, allowed, &key, parsed),
        Some(TcpState::Close) => {
            if let Some(flow) = tables.tcp.get(&key) {
                let rst = tcp::on_closed_flow(flow);
                let packet = build_tcp_packet(flow, &rst);
                emit(worker.config.tun_fd, pcap, &packet);
            }
        }
        Some(_) => {
            let payload = &raw[parsed.data_start.min(raw.len())..];
            let Some(flow) = tables.tcp.get_mut(&key) else { return };
            let fd = flow.socket;
            let now = worker.clock.now_secs();
            let effects = tcp::process_segment(flow, parsed, payload_len, now, |psh| {
                socket::send(fd, payload, !psh).is_ok()
            });
            if effects.shutdown_write {
                let _ = socket::shutdown_write(fd);
            }
            for seg in &effects.synth {
                let packet = build_tcp_packet(flow, seg);
                emit(worker.config.tun_fd, pcap, &packet);
            }
            if let Some(c) = effects.classification {
                if !c.is_allowed() {
                    debug!(?c, "dropping invalid out-of-order tcp segment");
                }
            }
        }
    }
}

fn handle_tcp_no_flow(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    allowed: &HashSet<i32>,
    key: &FlowKey,
    parsed: &ParsedPacket,
) {
    match tcp::on_no_flow(parsed, rand::random()) {
        tcp::NoFlowAction::Reject(rst) => {
            log_packet(worker, parsed, None, false, "stray segment for unknown flow");
            let packet = build_tcp_packet_raw(parsed, &rst);
            emit(worker.config.tun_fd, pcap, &packet);
        }
        tcp::NoFlowAction::Open {
            local_isn,
            remote_isn,
            send_window,
        } => {
            let local = SocketAddr::new(parsed.src_ip, parsed.src_port);
            let resolved_owner =
                owner::resolve_owner(worker.owner_table.as_ref(), IpProtocol::Tcp, parsed.version, local);
            let allow = !worker.config.filter || resolved_owner.is_some_and(|o| allowed.contains(&o));
            log_packet(worker, parsed, resolved_owner, allow, "");
            if !allow {
                return;
            }
            open_tcp_flow(worker, tables, *key, local_isn, remote_isn, send_window, resolved_owner);
        }
    }
}

fn open_tcp_flow(
    worker: &Worker,
    tables: &mut FlowTables,
    key: FlowKey,
    local_isn: u32,
    remote_isn: u32,
    send_window: u16,
    owner: Option<i32>,
) {
    let fd = match socket::open_tcp_nonblocking(key.version) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(error = %e, "failed to open upstream tcp socket");
            return;
        }
    };
    if !worker.callbacks.protect(fd) {
        warn!("host declined to protect tcp socket");
    }
    let dst = SocketAddr::new(key.dst_ip, key.dst_port);
    if let Err(e) = socket::connect_nonblocking(fd, dst) {
        warn!(error = %e, "tcp connect failed");
        socket::close(fd);
        return;
    }

    tables.tcp.insert(
        key,
        TcpFlow {
            key,
            state: TcpState::Listen,
            local_isn,
            local_seq: local_isn,
            remote_isn,
            remote_seq: remote_isn,
            send_window,
            socket: fd,
            last_activity: worker.clock.now_secs(),
            owner,
            seq: tables.next_seq(),
        },
    );
}

fn handle_tcp_sockets(
    worker: &Worker,
    tables: &mut FlowTables,
    pcap: &mut Option<PcapWriter>,
    rset: &FdSet,
    wset: &FdSet,
    eset: &FdSet,
) {
    let keys: Vec<FlowKey> = tables.tcp.keys().copied().collect();
    for key in keys {
        let Some(flow) = tables.tcp.get_mut(&key) else { continue };
        let fd = flow.socket;

        if eset.is_set(fd) {
            let rst = tcp::on_socket_exception(flow);
            let packet = build_tcp_packet(flow, &rst);
            emit(worker.config.tun_fd, pcap, &packet);
            continue;
        }

        match flow.state {
            TcpState::Listen if wset.is_set(fd) => {
                if let Err(e) = socket::take_socket_error(fd) {
                    debug!(error = %e, "tcp connect failed");
                    let rst = tcp::on_socket_exception(flow);
                    let packet = build_tcp_packet(flow, &rst);
                    emit(worker.config.tun_fd, pcap, &packet);
                    continue;
                }
                let _ = socket::set_blocking(fd, true);
                let synth = tcp::on_connect_complete(flow);
                let packet = build_tcp_packet(flow, &synth);
                emit(worker.config.tun_fd, pcap, &packet);
            }
            TcpState::SynRecv | TcpState::Established | TcpState::CloseWait
                if flow.send_window > 0 && rset.is_set(fd) =>
            {
                let limit = tcp::read_limit(flow);
                let mut buf = vec![0u8; limit.max(1)];
                match socket::recv(fd, &mut buf) {
                    Ok(n) => {
                        let synth = tcp::on_readable(flow, &buf[..n]);
                        let packet = build_tcp_packet(flow, &synth);
                        emit(worker.config.tun_fd, pcap, &packet);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(error = %e, "tcp recv failed");
                        let rst = tcp::on_socket_exception(flow);
                        let packet = build_tcp_packet(flow, &rst);
                        emit(worker.config.tun_fd, pcap, &packet);
                    }
                }
            }
            _ => {}
        }
    }
}

// --- shared helpers --------------------------------------------------

/// Builds a complete packet impersonating the remote side of `flow`
/// (source/destination swapped relative to the flow).
fn build_tcp_packet(flow: &TcpFlow, seg: &SynthSegment) -> Vec<u8> {
    match (flow.key.dst_ip, flow.key.src_ip) {
        (IpAddr::V4(remote), IpAddr::V4(local)) => synth::build_ipv4_tcp(
            remote,
            flow.key.dst_port,
            local,
            flow.key.src_port,
            seg.seq,
            seg.ack,
            seg.flags,
            &seg.payload,
        ),
        (IpAddr::V6(remote), IpAddr::V6(local)) => synth::build_ipv6_tcp(
            remote,
            flow.key.dst_port,
            local,
            flow.key.src_port,
            seg.seq,
            seg.ack,
            seg.flags,
            &seg.payload,
        ),
        _ => Vec::new(),
    }
}

/// Builds an unsolicited RST (seq=0, ack=segment.seq) for a segment with
/// no matching flow — only emitted for IPv4; see DESIGN.md.
fn build_tcp_packet_raw(parsed: &ParsedPacket, seg: &SynthSegment) -> Vec<u8> {
    match (parsed.dst_ip, parsed.src_ip) {
        (IpAddr::V4(remote), IpAddr::V4(local)) => synth::build_ipv4_tcp(
            remote,
            parsed.dst_port,
            local,
            parsed.src_port,
            seg.seq,
            seg.ack,
            seg.flags,
            &seg.payload,
        ),
        _ => Vec::new(),
    }
}

/// Writes a synthesised packet to TUN and, if enabled, the PCAP tap.
fn emit(tun_fd: RawFd, pcap: &mut Option<PcapWriter>, packet: &[u8]) {
    if packet.is_empty() {
        return;
    }
    if let Err(e) = socket::tun_write(tun_fd, packet) {
        warn!(error = %e, "failed to write synthesised packet to tun");
    }
    if let Some(writer) = pcap.as_mut() {
        if let Err(e) = writer.write_record(packet) {
            warn!(error = %e, "pcap write failed");
        }
    }
}

/// Taps an ingress packet into the PCAP capture before it is parsed.
fn capture_ingress(pcap: &mut Option<PcapWriter>, packet: &[u8]) {
    if let Some(writer) = pcap.as_mut() {
        if let Err(e) = writer.write_record(packet) {
            warn!(error = %e, "pcap write failed");
        }
    }
}

fn log_packet(worker: &Worker, parsed: &ParsedPacket, owner: Option<i32>, allowed: bool, extra: &str) {
    if !worker.config.log {
        return;
    }
    let record = PacketRecord {
        time_ms: worker.clock.now_secs() * 1000,
        version: parsed.version,
        protocol: parsed.protocol.number(),
        flags: tcp_flags_string(parsed.tcp_flags),
        source: parsed.src_ip,
        source_port: parsed.src_port,
        dest: parsed.dst_ip,
        dest_port: parsed.dst_port,
        extra: extra.to_string(),
        owner,
        allowed,
    };
    worker.callbacks.log_packet(record);
}

/// Drives every flow belonging to an owner no longer in `allowed` to
/// termination. Called from `Engine::check_allowed`, which may run on a
/// thread other than the worker — safe because the caller already holds
/// `state`'s lock (all other mutations occur while holding the global
/// mutex).
pub(crate) fn apply_allowlist(tun_fd: RawFd, state: &mut EngineState, allowed: &HashSet<i32>) {
    let EngineState { tables, pcap } = state;

    let tcp_keys: Vec<FlowKey> = tables.tcp.keys().copied().collect();
    for key in tcp_keys {
        let Some(flow) = tables.tcp.get_mut(&key) else { continue };
        if flow.state.is_terminal() {
            continue;
        }
        let blocked = matches!(flow.owner, Some(o) if !allowed.contains(&o));
        if !blocked {
            continue;
        }
        let rst = SynthSegment {
            seq: flow.local_seq,
            ack: flow.remote_seq,
            flags: TcpFlags::rst_only(),
            payload: Vec::new(),
        };
        flow.state = TcpState::TimeWait;
        let packet = build_tcp_packet(flow, &rst);
        emit(tun_fd, pcap, &packet);
    }

    for flow in tables.udp.values_mut() {
        if matches!(flow.owner, Some(o) if !allowed.contains(&o)) {
            flow.stop = true;
        }
    }
}
