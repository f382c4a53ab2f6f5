//! The prober side of one heartbeat connection.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::channel::HeartbeatChannel;
use crate::error::HeartbeatError;
use crate::message::{CHECK, HANDSHAKE, parse_handshake_reply};

/// Read policy of heartbeat replies.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Read attempts per reply. Default: 3.
    pub max_retries: u32,
    /// Deadline of each attempt. Default: 6 s.
    pub read_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            read_timeout: Duration::from_millis(6000),
        }
    }
}

#[derive(Debug)]
struct Status {
    ok: bool,
    initialized: bool,
    uuid: Option<String>,
}

/// A monitored peer, seen from the driver.
///
/// The first [`run`](Self::run) performs the handshake and learns the peer's
/// uuid; later runs send a check. Any failure marks the connection not ok and
/// closes it for good.
pub struct HeartbeatConnection {
    config: HeartbeatConfig,
    peer_addr: Option<SocketAddr>,
    channel: tokio::sync::Mutex<Option<HeartbeatChannel>>,
    status: Mutex<Status>,
    closed: watch::Sender<bool>,
}

impl HeartbeatConnection {
    /// Wrap an accepted heartbeat socket.
    pub fn new(stream: TcpStream, config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        let channel = HeartbeatChannel::new(stream)?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            config,
            peer_addr: channel.peer_addr(),
            channel: tokio::sync::Mutex::new(Some(channel)),
            status: Mutex::new(Status {
                ok: true,
                initialized: false,
                uuid: None,
            }),
            closed,
        })
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Verdict of the last exchange.
    pub fn is_ok(&self) -> bool {
        self.status().ok
    }

    /// Whether the reaper has acknowledged the handshake.
    pub fn is_initialized(&self) -> bool {
        self.status().initialized
    }

    pub(crate) fn set_initialized(&self) {
        self.status().initialized = true;
    }

    /// Uuid learned in the handshake.
    pub fn uuid(&self) -> Option<String> {
        self.status().uuid.clone()
    }

    /// Remote address of the heartbeat socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Execute one heartbeat exchange and return the verdict.
    pub async fn run(&self) -> bool {
        if !self.is_ok() {
            return false;
        }
        let result = match self.uuid() {
            None => self.handshake().await,
            Some(_) => self.check().await,
        };
        if let Err(e) = result {
            tracing::warn!("Heartbeat connection {self:?} failed: {e}");
            self.close();
        }
        self.is_ok()
    }

    async fn handshake(&self) -> Result<(), HeartbeatError> {
        self.send_message(HANDSHAKE).await?;
        let reply = self.receive_message().await?;
        let uuid = parse_handshake_reply(&reply)?;
        tracing::debug!("Heartbeat handshake with {:?} identified {uuid}", self.peer_addr);
        self.status().uuid = Some(uuid.to_string());
        Ok(())
    }

    async fn check(&self) -> Result<(), HeartbeatError> {
        self.send_message(CHECK).await?;
        // The content of the reply is not validated.
        let reply = self.receive_message().await?;
        tracing::trace!("Heartbeat check of {self:?} answered {reply:?}");
        Ok(())
    }

    /// Send one message to the peer. A failure closes the connection.
    pub async fn send_message(&self, message: &str) -> Result<(), HeartbeatError> {
        let mut guard = self.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => self.until_closed(channel.send(message)).await,
            None => Err(HeartbeatError::Closed),
        };
        if result.is_err() {
            guard.take();
            self.mark_failed();
        }
        result
    }

    /// Wait for one message from the peer, retrying timed-out reads. A
    /// failure closes the connection.
    pub async fn receive_message(&self) -> Result<String, HeartbeatError> {
        let mut guard = self.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => {
                let receive = channel.receive(self.config.read_timeout, self.config.max_retries);
                self.until_closed(receive).await
            }
            None => Err(HeartbeatError::Closed),
        };
        if result.is_err() {
            guard.take();
            self.mark_failed();
        }
        result
    }

    /// Mark the connection not ok and close its socket. Safe from any thread.
    pub fn close(&self) {
        self.mark_failed();
        // An exchange in progress holds the lock; it sees the signal and
        // drops the socket itself.
        if let Ok(mut guard) = self.channel.try_lock() {
            guard.take();
        }
    }

    fn mark_failed(&self) {
        self.status().ok = false;
        self.closed.send_replace(true);
    }

    async fn until_closed<T>(
        &self,
        exchange: impl Future<Output = Result<T, HeartbeatError>>,
    ) -> Result<T, HeartbeatError> {
        let mut closed = self.closed.subscribe();
        let signal = async {
            loop {
                if *closed.borrow_and_update() {
                    break;
                }
                if closed.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            result = exchange => result,
            _ = signal => Err(HeartbeatError::Closed),
        }
    }
}

impl fmt::Debug for HeartbeatConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("HeartbeatConnection")
            .field("peer_addr", &self.peer_addr)
            .field("uuid", &status.uuid)
            .field("ok", &status.ok)
            .field("initialized", &status.initialized)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::tests::stream_pair;
    use crate::message::reply_to;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    pub(crate) fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            max_retries: 2,
            read_timeout: Duration::from_millis(100),
        }
    }

    /// A node answering every message of the prober like a live peer would.
    pub(crate) fn spawn_live_node(stream: TcpStream, uuid: &'static str) {
        tokio::spawn(async move {
            let mut channel = HeartbeatChannel::new(stream).unwrap();
            while let Ok(message) = channel.receive_line().await {
                if channel.send(&reply_to(&message, uuid)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// A prober connection to a live node.
    pub(crate) async fn live_connection(uuid: &'static str) -> Arc<HeartbeatConnection> {
        let (node, driver) = stream_pair().await;
        spawn_live_node(node, uuid);
        Arc::new(HeartbeatConnection::new(driver, fast_config()).unwrap())
    }

    /// A prober connection whose peer vanished.
    pub(crate) async fn dead_connection() -> Arc<HeartbeatConnection> {
        let (node, driver) = stream_pair().await;
        drop(node);
        Arc::new(HeartbeatConnection::new(driver, fast_config()).unwrap())
    }

    #[tokio::test]
    async fn test_handshake_then_checks() {
        let connection = live_connection("node-7").await;
        assert!(connection.uuid().is_none());

        assert!(connection.run().await);
        assert_eq!(connection.uuid().as_deref(), Some("node-7"));
        assert!(!connection.is_initialized());

        assert!(connection.run().await);
        assert!(connection.run().await);
        assert!(connection.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_handshake_reply_fails_fast() {
        let (node, driver) = stream_pair().await;
        let connection = HeartbeatConnection::new(driver, fast_config()).unwrap();
        let node_task = tokio::spawn(async move {
            let mut channel = HeartbeatChannel::new(node).unwrap();
            let message = channel.receive_line().await.unwrap();
            assert_eq!(message, HANDSHAKE);
            channel.send("checked").await.unwrap();
            // The prober hangs up instead of retrying.
            matches!(channel.receive_line().await, Err(HeartbeatError::Closed))
        });

        assert!(!connection.run().await);
        assert!(!connection.is_ok());
        assert!(connection.uuid().is_none());
        assert!(node_task.await.unwrap());
        // A failed connection is never retried.
        assert!(!connection.run().await);
    }

    #[tokio::test]
    async fn test_silent_peer_exhausts_retries() {
        let (_node, driver) = stream_pair().await;
        let connection = HeartbeatConnection::new(driver, fast_config()).unwrap();
        assert!(!connection.run().await);
        assert!(!connection.is_ok());
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_exchange() {
        let (mut node, driver) = stream_pair().await;
        let connection = Arc::new(HeartbeatConnection::new(
            driver,
            HeartbeatConfig {
                max_retries: 100,
                read_timeout: Duration::from_secs(1),
            },
        )
        .unwrap());

        let runner = Arc::clone(&connection);
        let run = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.close();

        let verdict = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(!verdict);

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), node.read_to_end(&mut buf)).await;
        assert!(read.unwrap().is_ok());
        assert_eq!(buf, b"handshake\n");
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let connection = live_connection("n").await;
        connection.close();
        assert!(matches!(
            connection.send_message(CHECK).await,
            Err(HeartbeatError::Closed)
        ));
    }
}
