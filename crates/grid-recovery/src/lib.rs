//! Heartbeat-based failure detection between the driver and its peers.
//!
//! The driver runs a [`RecoveryServer`] on a dedicated port. Every accepted
//! socket becomes a [`HeartbeatConnection`]; its first exchange is a
//! handshake returning the peer's uuid, later exchanges are checks. The
//! [`Reaper`] runs every monitored connection on a timer and evicts the ones
//! that fail, notifying its [`ReaperListener`]s. Nodes and clients run a
//! [`HeartbeatResponder`] answering those probes.
//!
//! Heartbeat messages are newline-terminated UTF-8 lines, independent of the
//! length-prefixed frames of the main transport.

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod error;
pub mod listener;
pub mod message;
pub mod reaper;
pub mod responder;
pub mod server;

pub use backoff::{Backoff, ReconnectConfig};
pub use channel::HeartbeatChannel;
pub use connection::{HeartbeatConfig, HeartbeatConnection};
pub use error::{HeartbeatError, RecoveryError};
pub use listener::{HeartbeatEvent, ReaperListener, ResponderListener};
pub use reaper::{Reaper, ReaperConfig};
pub use responder::{ConnectionState, ConnectionStateWatch, HeartbeatResponder, ResponderConfig};
pub use server::{RecoveryServer, RecoveryServerConfig};
