//! Error types of the channel framework.

use std::net::SocketAddr;

use crate::framing::FrameError;
use crate::graph::GraphError;

/// Errors raised while a channel runs one of its states.
///
/// Any of these is fatal to the channel it occurred on and to no other.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Framing failed, including the peer closing the connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote identity was already set for this channel.
    #[error("channel already identified as {0}")]
    AlreadyIdentified(String),

    /// The peer sent something the current state cannot accept.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The state logic panicked.
    #[error("state panicked: {0}")]
    Panicked(String),
}

impl ChannelError {
    /// Whether the error just means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ChannelError::Frame(FrameError::ConnectionClosed) => true,
            ChannelError::Frame(FrameError::Io(e)) | ChannelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Errors of the reactor itself.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The protocol's state graph is incomplete.
    #[error("invalid state graph: {0}")]
    Graph(#[from] GraphError),

    /// A listening port could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The readiness wait failed; the reactor loop terminated.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] std::io::Error),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// [`Reactor::start`](crate::Reactor::start) was called twice.
    #[error("reactor already started")]
    AlreadyStarted,

    /// The reactor is not running.
    #[error("reactor is stopped")]
    Stopped,
}
