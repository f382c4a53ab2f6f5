//! The probed side: a node or client answering the driver's heartbeats.
//!
//! A [`HeartbeatResponder`] connects to the recovery server, reconnecting with
//! backoff while it is unreachable, then answers every message until the
//! socket fails or the driver falls silent for longer than the idle timeout.
//! Either way its listeners learn that the driver is gone. State changes are
//! broadcast through a [`ConnectionStateWatch`].

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::backoff::ReconnectConfig;
use crate::channel::HeartbeatChannel;
use crate::error::HeartbeatError;
use crate::listener::{HeartbeatEvent, ResponderListener};
use crate::message::{CHECK, HANDSHAKE, reply_to};

/// Responder connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Trying to reach the recovery server.
    Connecting,
    /// Answering heartbeats.
    Connected,
    /// Not connected, either not yet or no longer.
    Disconnected,
}

/// Observable [`ConnectionState`] backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// A watch starting [`Disconnected`](ConnectionState::Disconnected).
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Publish `state` to every subscriber.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// A receiver observing future changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// The current state.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Responder settings.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Address of the driver's recovery server.
    pub server_addr: SocketAddr,
    /// Identity sent in reply to the handshake.
    pub uuid: String,
    /// Retry policy while the server is unreachable.
    pub reconnect: ReconnectConfig,
    /// Longest silence tolerated from the driver; `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

/// Heartbeat endpoint of a node or client.
pub struct HeartbeatResponder {
    config: ResponderConfig,
    state: Arc<ConnectionStateWatch>,
    listeners: RwLock<Vec<Arc<dyn ResponderListener>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl HeartbeatResponder {
    /// Create a responder; nothing happens until [`run`](Self::run).
    pub fn new(config: ResponderConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state: Arc::new(ConnectionStateWatch::new()),
            listeners: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Connection state of the responder.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn ResponderListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Unregister a listener; returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ResponderListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Connect, then answer heartbeats until the driver is lost or
    /// [`close`](Self::close) is called.
    ///
    /// Returns `Ok(())` when closed locally. Any other end fires
    /// `heartbeat_failed` and returns the cause.
    pub async fn run(&self) -> Result<(), HeartbeatError> {
        let result = match self.connect().await {
            Ok(Some(mut channel)) => {
                self.state.set(ConnectionState::Connected);
                tracing::info!("Heartbeat responder connected to {}", self.config.server_addr);
                let served = self.serve(&mut channel).await;
                channel.shutdown().await;
                served
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.state.set(ConnectionState::Disconnected);

        if let Err(e) = &result {
            tracing::warn!(
                "Heartbeat with driver at {} lost: {e}",
                self.config.server_addr
            );
            let event = HeartbeatEvent {
                uuid: Some(self.config.uuid.clone()),
                peer_addr: Some(self.config.server_addr),
            };
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for listener in listeners {
                listener.heartbeat_failed(&event);
            }
        }
        result
    }

    /// Reach the server, backing off between failures. `None` if closed meanwhile.
    async fn connect(&self) -> Result<Option<HeartbeatChannel>, HeartbeatError> {
        self.state.set(ConnectionState::Connecting);
        let mut delays = self.config.reconnect.delays();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempts = 0;
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            attempts += 1;
            match TcpStream::connect(self.config.server_addr).await {
                Ok(stream) => return Ok(Some(HeartbeatChannel::new(stream)?)),
                Err(e) => tracing::debug!(
                    "Recovery server {} unreachable: {e}",
                    self.config.server_addr
                ),
            }
            let Some(delay) = delays.next() else {
                return Err(HeartbeatError::ReconnectExhausted(attempts));
            };
            tracing::info!(
                "Recovery server unreachable after {attempts} attempts, retrying in {delay:?}"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    async fn serve(&self, channel: &mut HeartbeatChannel) -> Result<(), HeartbeatError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let received = tokio::select! {
                received = self.next_message(channel) => received,
                _ = shutdown_rx.changed() => continue,
            };
            let message = received?;
            if message != HANDSHAKE && message != CHECK {
                tracing::debug!("Unknown heartbeat message {message:?}, answering as a check");
            }
            channel.send(&reply_to(&message, &self.config.uuid)).await?;
        }
    }

    async fn next_message(&self, channel: &mut HeartbeatChannel) -> Result<String, HeartbeatError> {
        match self.config.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, channel.receive_line())
                .await
                .map_err(|_| HeartbeatError::Timeout {
                    attempts: 1,
                    timeout: idle,
                })?,
            None => channel.receive_line().await,
        }
    }

    /// Stop answering and disconnect. Safe from any thread.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
