//! Per-connection channel state.

use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ChannelError;
use crate::framing::{FrameConfig, MessageFramer};
use crate::interest::InterestOps;
use crate::protocol::Protocol;
use crate::transport::ChannelTransport;

/// Unique identifier for a channel within one reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a generator whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the framework knows about one connection.
///
/// A context is owned by exactly one thread at a time: the reactor while the
/// channel waits for readiness, or the worker running its transition. Nothing
/// in it is locked.
pub struct ChannelContext<P: Protocol> {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    transport: ChannelTransport,
    state: P::State,
    message: MessageFramer,
    uuid: Option<String>,
    peer: bool,
    enabled: bool,
    interest: InterestOps,
    closed: bool,
    /// Protocol-specific data created by [`Protocol::create_attachment`].
    pub attachment: P::Attachment,
}

impl<P: Protocol> ChannelContext<P> {
    pub(crate) fn new(
        id: ConnectionId,
        transport: ChannelTransport,
        state: P::State,
        frame_config: FrameConfig,
        attachment: P::Attachment,
    ) -> Self {
        let peer_addr = transport.stream().peer_addr().ok();
        Self {
            id,
            peer_addr,
            transport,
            state,
            message: MessageFramer::new(frame_config),
            uuid: None,
            peer: false,
            enabled: true,
            interest: InterestOps::NONE,
            closed: false,
            attachment,
        }
    }

    /// Identifier of this channel.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, if the socket reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Current state tag.
    pub fn state(&self) -> P::State {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: P::State) {
        self.state = state;
    }

    /// Interest mask last applied by a transition.
    pub fn interest(&self) -> InterestOps {
        self.interest
    }

    pub(crate) fn set_interest(&mut self, interest: InterestOps) {
        self.interest = interest;
    }

    /// Identity of the remote node or client, once known.
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Record the remote identity. It can be set only once.
    pub fn set_uuid(&mut self, uuid: impl Into<String>) -> Result<(), ChannelError> {
        if let Some(existing) = &self.uuid {
            return Err(ChannelError::AlreadyIdentified(existing.clone()));
        }
        self.uuid = Some(uuid.into());
        Ok(())
    }

    /// Whether the channel encrypts its traffic.
    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Whether the remote end is another driver rather than a node or client.
    pub fn is_peer(&self) -> bool {
        self.peer
    }

    /// Mark the remote end as a peer driver.
    pub fn set_peer(&mut self, peer: bool) {
        self.peer = peer;
    }

    /// Whether the channel accepts work.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the channel.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Continue reading the current incoming message.
    ///
    /// Returns `true` once it is complete; see [`MessageFramer::read_message`].
    pub fn read_message(&mut self) -> Result<bool, ChannelError> {
        Ok(self.message.read_message(&mut self.transport)?)
    }

    /// Queue `payload` as the next outgoing message.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        Ok(self.message.start_write(payload)?)
    }

    /// Continue writing the queued outgoing message.
    ///
    /// Returns `true` once it is fully written.
    pub fn write_message(&mut self) -> Result<bool, ChannelError> {
        Ok(self.message.write_message(&mut self.transport)?)
    }

    /// Take the payload of a completely read message, resetting the framer.
    pub fn take_message(&mut self) -> Option<Vec<u8>> {
        self.message.take_payload()
    }

    /// The in-flight message.
    pub fn message(&self) -> &MessageFramer {
        &self.message
    }

    /// Drop the in-flight message, e.g. after a write completed.
    pub fn reset_message(&mut self) {
        self.message.reset();
    }

    /// Bytes moved on the socket, including any encryption overhead.
    pub fn channel_count(&self) -> u64 {
        self.transport.transferred()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut the socket down. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.transport.stream().shutdown(Shutdown::Both) {
            tracing::trace!("Channel {} shutdown: {e}", self.id);
        }
    }

    pub(crate) fn transport(&self) -> &ChannelTransport {
        &self.transport
    }

    pub(crate) fn transport_mut(&mut self) -> &mut ChannelTransport {
        &mut self.transport
    }
}

impl<P: Protocol> fmt::Debug for ChannelContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("interest", &self.interest)
            .field("uuid", &self.uuid)
            .field("secure", &self.is_secure())
            .field("peer", &self.peer)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{Blank, BlankState};

    /// A connected loopback socket pair: the mio end and the std peer.
    pub(crate) fn socket_pair() -> (mio::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(local), peer)
    }

    pub(crate) fn test_context<P: Protocol>(
        state: P::State,
        attachment: P::Attachment,
    ) -> (ChannelContext<P>, std::net::TcpStream) {
        let (local, peer) = socket_pair();
        let ctx = ChannelContext::new(
            ConnectionId(1),
            ChannelTransport::plain(local),
            state,
            FrameConfig::default(),
            attachment,
        );
        (ctx, peer)
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        assert_eq!(id1.0 + 1, id2.0);
        assert_eq!(IdGenerator::starting_at(10).next_id(), ConnectionId(10));
    }

    #[test]
    fn test_uuid_is_set_once() {
        let (mut ctx, _peer) = test_context::<Blank>(BlankState::Only, ());
        assert!(ctx.uuid().is_none());
        ctx.set_uuid("node-1").unwrap();
        assert!(matches!(
            ctx.set_uuid("node-2"),
            Err(ChannelError::AlreadyIdentified(ref id)) if id == "node-1"
        ));
        assert_eq!(ctx.uuid(), Some("node-1"));
    }

    #[test]
    fn test_new_context_defaults() {
        let (ctx, _peer) = test_context::<Blank>(BlankState::Only, ());
        assert!(ctx.is_enabled());
        assert!(!ctx.is_peer());
        assert!(!ctx.is_secure());
        assert!(ctx.interest().is_empty());
        assert!(ctx.peer_addr().is_some());
    }

    #[test]
    fn test_read_message_from_peer() {
        use std::io::Write;

        let (mut ctx, mut peer) = test_context::<Blank>(BlankState::Only, ());
        peer.write_all(&[0, 0, 0, 3, b'j', b'o', b'b']).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !ctx.read_message().unwrap() {
            assert!(std::time::Instant::now() < deadline, "message never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(ctx.take_message().unwrap(), b"job");
        assert_eq!(ctx.channel_count(), 7);
    }

    #[test]
    fn test_close_is_idempotent_and_peer_sees_eof() {
        use std::io::Read;

        let (mut ctx, mut peer) = test_context::<Blank>(BlankState::Only, ());
        ctx.close();
        ctx.close();
        assert!(ctx.is_closed());
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }
}
