//! Inputs the host supplies at start.
//!
//! `EngineConfig` is a plain data value; the engine never reads a file
//! itself. A host that wants to persist or load one from JSON can do so
//! via `serde`, but that loading is the host's responsibility.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Timeout threshold constants.
pub mod timeouts {
    pub const UDP_TIMEOUT_ANY_SECS: i64 = 180;
    pub const UDP_TIMEOUT_53_SECS: i64 = 10;
    pub const TCP_INIT_TIMEOUT_SECS: i64 = 30;
    pub const TCP_ESTABLISHED_TIMEOUT_SECS: i64 = 3600;
    pub const TCP_CLOSING_TIMEOUT_SECS: i64 = 30;
    pub const TCP_KEEP_TIMEOUT_SECS: i64 = 300;
    pub const SELECT_TIMEOUT_SECS: i64 = 10;
    pub const DNS_TTL_SECS: u32 = 10;
    /// Owner-identity resolution retry contract.
    pub const UID_MAXTRY: u32 = 3;
    pub const UID_INITIAL_DELAY_MS: u64 = 10;
    pub const UID_RETRY_DELAY_MS: u64 = 20;
}

/// Buffer/record size constants.
pub mod limits {
    pub const TUN_MAXMSG: usize = 32768;
    pub const TCP_SEND_WINDOW: usize = 16384;
    pub const TCP_RECV_WINDOW: u16 = 65535;
    pub const DNS_QNAME_MAX: usize = 255;
    pub const MAX_PCAP_RECORD: u32 = 65535;
    pub const MAX_PCAP_FILE: u64 = 2 * 1024 * 1024;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Already-opened TUN file descriptor; the engine reads/writes raw IP
    /// packets on it and never creates or destroys it.
    pub tun_fd: RawFd,
    /// Owner identities permitted to have flows created for them.
    pub allowed_owners: Vec<i32>,
    /// Optional path to a hosts blocklist file.
    pub hosts_path: Option<PathBuf>,
    pub log: bool,
    pub filter: bool,
    pub debug: bool,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tun_fd: -1,
            allowed_owners: Vec::new(),
            hosts_path: None,
            log: false,
            filter: true,
            debug: false,
            log_level: LogLevel::Warn,
        }
    }
}
