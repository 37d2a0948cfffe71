//! # Backhaul
//!
//! Server half of a reverse TCP/UDP tunneling relay.
//!
//! A single long-lived *control channel* to a remote client carries
//! out-of-band commands; the client answers by opening short-lived *data
//! channels* back to the same tunnel listener, which the server pools and
//! pairs by id. Local traffic arriving on the target listeners is spliced
//! through a pooled channel to the remote side.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Supervisor                        │
//! │      (start / stop, restart-on-error, signals)       │
//! ├─────────────────────────────────────────────────────┤
//! │               Target dispatchers                     │
//! │     (TCP accept loop, UDP one-shot datagram loop)    │
//! ├─────────────────────────────────────────────────────┤
//! │              Data channel pool                       │
//! │      (pre-accepted idle channels, paired by id)      │
//! ├─────────────────────────────────────────────────────┤
//! │              Control channel                         │
//! │  (handshake, launch signals, keepalive, pool flush)  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod tls;

pub use config::{ServerConfig, Settings, Tunables};
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Operation cancelled")]
    Cancelled,
}
