//! Notifications of the heartbeat subsystem.

use std::net::SocketAddr;

use crate::connection::HeartbeatConnection;

/// The peer a notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    /// Uuid of the peer, if its handshake completed.
    pub uuid: Option<String>,
    /// Address of the other end of the heartbeat socket.
    pub peer_addr: Option<SocketAddr>,
}

impl HeartbeatEvent {
    pub(crate) fn of(connection: &HeartbeatConnection) -> Self {
        Self {
            uuid: connection.uuid(),
            peer_addr: connection.peer_addr(),
        }
    }
}

/// Observer of the reaper's evaluations.
pub trait ReaperListener: Send + Sync {
    /// A connection completed its handshake and is now monitored.
    fn connection_added(&self, _event: &HeartbeatEvent) {}

    /// A connection failed a check and was evicted.
    fn connection_failed(&self, _event: &HeartbeatEvent) {}
}

/// Observer of a heartbeat responder.
pub trait ResponderListener: Send + Sync {
    /// The recovery server stopped probing or could not be reached.
    fn heartbeat_failed(&self, event: &HeartbeatEvent);
}
