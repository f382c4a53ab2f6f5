//! Error types of the heartbeat subsystem.

use std::net::SocketAddr;
use std::time::Duration;

/// Failure of one heartbeat exchange. Always fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// A socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply arrived within any read attempt.
    #[error("no reply after {attempts} attempts of {timeout:?}")]
    Timeout {
        /// Attempts made.
        attempts: u32,
        /// Deadline of each attempt.
        timeout: Duration,
    },

    /// The connection was closed, locally or by the peer.
    #[error("heartbeat connection closed")]
    Closed,

    /// A reply did not follow the protocol.
    #[error("malformed heartbeat reply {0:?}")]
    MalformedReply(String),

    /// An incoming message exceeded the maximum line length.
    #[error("heartbeat message longer than {0} bytes")]
    LineTooLong(usize),

    /// An outgoing message contained a line break.
    #[error("heartbeat message {0:?} contains a line break")]
    InvalidMessage(String),

    /// The responder gave up connecting to the recovery server.
    #[error("recovery server unreachable after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Errors of the recovery server.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The recovery port could not be bound.
    #[error("failed to bind recovery server on {addr}: {source}")]
    Bind {
        /// The address that failed.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
