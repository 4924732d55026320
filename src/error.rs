//! Network error types.

use std::time::Duration;

/// Errors that can occur in the lanchat crate.
///
/// Transport and protocol errors are terminal for the affected connection;
/// codec errors are recoverable at steady-state call sites but terminal
/// during the handshake.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// An I/O error on a socket (connect/read/write failure).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire protocol violation (bad framing, wrong handshake message).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message body failed to match its declared schema.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An encoded body exceeded the wire format's size cap.
    #[error("Message body of {0} bytes exceeds the wire size cap")]
    BodyTooLarge(usize),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The engine is not running.
    #[error("Engine not running")]
    NotRunning,

    /// The connection has already been closed.
    #[error("Connection closed")]
    Closed,
}
