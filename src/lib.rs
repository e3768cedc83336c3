//! A userspace packet-interception and proxying engine for an
//! already-established TUN device: a concurrent UDP/TCP session table,
//! a synthesised TCP half-stack, a UDP translator with an embedded DNS
//! sinkhole, and a single `pselect`-driven worker thread tying it all
//! together.
//!
//! The crate does not open or configure the TUN device itself — a host
//! application (see `src/bin/sinkhole-demo.rs` for a minimal one) is
//! expected to create the interface, hand the engine its file
//! descriptor via [`EngineConfig`], and implement [`HostCallbacks`] for
//! the three things only the host can do: exempt a socket from the
//! tunnel, receive packet-log records, and learn when the worker exits.

pub mod callbacks;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod dns;
mod engine;
pub mod error;
pub mod flow;
pub mod hosts;
pub mod ingress;
pub mod log_record;
pub mod owner;
pub mod packet;
pub mod pcap;
pub mod sweep;
pub mod synth;
pub mod tcp;
pub mod udp;

pub use callbacks::HostCallbacks;
pub use clock::{Clock, SystemClock};
pub use config::{EngineConfig, LogLevel};
pub use engine::{signal, Engine};
pub use error::{Error, Result};
pub use flow::{FlowKey, FlowTables, TcpFlow, TcpState, UdpFlow};
pub use log_record::PacketRecord;
pub use owner::{OwnerTable, ProcOwnerTable};
