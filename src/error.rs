use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for conditions that are fatal to the worker or to
/// construction. Per-flow and soft errors (bad DNS, stray segments,
/// socket send failures) are handled inline as RST/`stop` and never
/// surface as `Error`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("packet too short: need {need} bytes, have {have}")]
    PacketTooShort { need: usize, have: usize },

    #[error("unsupported IP protocol number {0}")]
    UnsupportedProtocol(u8),

    #[error("pcap error: {0}")]
    Pcap(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}
