//! Non-blocking channel framework of the job grid.
//!
//! A [`Reactor`] multiplexes readiness over many sockets on one thread and
//! runs per-channel logic on a [`TransitionExecutor`] pool. What a channel does
//! is described by a [`Protocol`]: a [`StateGraph`] mapping state tags to
//! [`ChannelState`] behaviors and transition tags to the next state plus the
//! [`InterestOps`] to wait for there. Messages are framed with a 4-byte
//! big-endian length prefix by [`MessageFramer`].

pub mod context;
pub mod error;
pub mod executor;
pub mod framing;
pub mod graph;
pub mod interest;
pub mod protocol;
pub mod reactor;
mod socket;
pub mod transport;

#[cfg(test)]
mod testing;

pub use context::{ChannelContext, ConnectionId, IdGenerator};
pub use error::{ChannelError, ReactorError};
pub use executor::{Outcome, TransitionExecutor};
pub use framing::{FrameConfig, FrameError, LENGTH_PREFIX_SIZE, MessageFramer, read_frame, write_frame};
pub use graph::{ChannelState, GraphBuilder, GraphError, GraphTag, StateGraph, Transition};
pub use interest::InterestOps;
pub use protocol::Protocol;
pub use reactor::{Reactor, ReactorConfig, ReactorHandle};
pub use transport::{ChannelTransport, CipherEngine, SecureTransport};
