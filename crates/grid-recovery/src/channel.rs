//! Line-oriented heartbeat socket.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::HeartbeatError;

/// Idle time before the OS sends the first keepalive probe.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Longest accepted message, excluding the line terminator.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Apply `TCP_NODELAY` and keepalive to a heartbeat socket.
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// One heartbeat socket exchanging newline-terminated messages.
pub struct HeartbeatChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: Option<SocketAddr>,
    /// Bytes of a line whose read was interrupted by a timeout.
    line: Vec<u8>,
}

impl HeartbeatChannel {
    /// Wrap a connected socket.
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        configure_stream(&stream)?;
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            peer_addr,
            line: Vec::new(),
        })
    }

    /// Remote address, if the socket reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Send one message.
    pub async fn send(&mut self, message: &str) -> Result<(), HeartbeatError> {
        if message.contains(['\n', '\r']) {
            return Err(HeartbeatError::InvalidMessage(message.to_string()));
        }
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Wait for the next message, however long it takes.
    ///
    /// Cancel safe: bytes of a partially received line are kept for the next
    /// call. A line longer than [`MAX_LINE_LENGTH`] fails with
    /// [`HeartbeatError::LineTooLong`].
    pub async fn receive_line(&mut self) -> Result<String, HeartbeatError> {
        // One byte more than the limit leaves room for the terminator.
        let budget = (MAX_LINE_LENGTH + 1 - self.line.len()) as u64;
        (&mut self.reader)
            .take(budget)
            .read_until(b'\n', &mut self.line)
            .await?;
        if self.line.last() != Some(&b'\n') {
            if self.line.len() > MAX_LINE_LENGTH {
                self.line.clear();
                return Err(HeartbeatError::LineTooLong(MAX_LINE_LENGTH));
            }
            return Err(HeartbeatError::Closed);
        }
        self.line.pop();
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        String::from_utf8(std::mem::take(&mut self.line)).map_err(|e| {
            HeartbeatError::MalformedReply(String::from_utf8_lossy(e.as_bytes()).into_owned())
        })
    }

    /// Wait for the next message with up to `max_retries` attempts of
    /// `read_timeout` each.
    pub async fn receive(
        &mut self,
        read_timeout: Duration,
        max_retries: u32,
    ) -> Result<String, HeartbeatError> {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            match tokio::time::timeout(read_timeout, self.receive_line()).await {
                Ok(result) => return result,
                Err(_) => tracing::debug!(
                    "Heartbeat read from {:?} timed out (attempt {attempt}/{attempts})",
                    self.peer_addr
                ),
            }
        }
        Err(HeartbeatError::Timeout {
            attempts,
            timeout: read_timeout,
        })
    }

    /// Close the write side, telling the peer no more messages follow.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!("Heartbeat shutdown of {:?}: {e}", self.peer_addr);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// A connected pair of raw sockets: (connecting side, accepted side).
    pub(crate) async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    async fn channel_pair() -> (HeartbeatChannel, HeartbeatChannel) {
        let (a, b) = stream_pair().await;
        (HeartbeatChannel::new(a).unwrap(), HeartbeatChannel::new(b).unwrap())
    }

    #[tokio::test]
    async fn test_messages_cross_in_order() {
        let (mut a, mut b) = channel_pair().await;
        a.send("handshake").await.unwrap();
        a.send("check").await.unwrap();
        let timeout = Duration::from_secs(5);
        assert_eq!(b.receive(timeout, 1).await.unwrap(), "handshake");
        assert_eq!(b.receive(timeout, 1).await.unwrap(), "check");
        assert!(a.peer_addr().is_some());
    }

    #[tokio::test]
    async fn test_receive_gives_up_after_all_retries() {
        let (_a, mut b) = channel_pair().await;
        let start = Instant::now();
        let err = b.receive(Duration::from_millis(30), 3).await.unwrap_err();
        assert!(matches!(err, HeartbeatError::Timeout { attempts: 3, .. }));
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_late_reply_within_retries_is_accepted() {
        let (mut a, mut b) = channel_pair().await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.send("checked").await.unwrap();
            // Keep the socket open until the reply was read.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });
        let reply = b.receive(Duration::from_millis(30), 5).await.unwrap();
        assert_eq!(reply, "checked");
    }

    #[tokio::test]
    async fn test_partial_line_survives_timeout() {
        let (mut raw, accepted) = stream_pair().await;
        let mut channel = HeartbeatChannel::new(accepted).unwrap();
        raw.write_all(b"chec").await.unwrap();
        raw.flush().await.unwrap();
        assert!(channel.receive(Duration::from_millis(30), 1).await.is_err());
        raw.write_all(b"k\r\n").await.unwrap();
        let message = channel.receive(Duration::from_secs(5), 1).await.unwrap();
        assert_eq!(message, "check");
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (a, mut b) = channel_pair().await;
        drop(a);
        let err = b.receive(Duration::from_secs(5), 3).await.unwrap_err();
        assert!(matches!(err, HeartbeatError::Closed | HeartbeatError::Io(_)));
    }

    #[tokio::test]
    async fn test_endless_line_is_cut_off() {
        let (mut raw, accepted) = stream_pair().await;
        let mut channel = HeartbeatChannel::new(accepted).unwrap();
        let flood = vec![b'x'; MAX_LINE_LENGTH * 4];
        let writer = tokio::spawn(async move {
            // The reader gives up before the flood is consumed.
            let _ = raw.write_all(&flood).await;
            raw
        });
        let err = channel.receive(Duration::from_secs(5), 1).await.unwrap_err();
        assert!(matches!(err, HeartbeatError::LineTooLong(MAX_LINE_LENGTH)));
        drop(writer);
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let (mut raw, accepted) = stream_pair().await;
        let mut channel = HeartbeatChannel::new(accepted).unwrap();
        let mut line = vec![b'a'; MAX_LINE_LENGTH];
        line.push(b'\n');
        raw.write_all(&line).await.unwrap();
        let message = channel.receive(Duration::from_secs(5), 1).await.unwrap();
        assert_eq!(message.len(), MAX_LINE_LENGTH);
    }

    #[tokio::test]
    async fn test_line_breaks_are_rejected() {
        let (mut a, _b) = channel_pair().await;
        assert!(matches!(
            a.send("check\nhandshake").await,
            Err(HeartbeatError::InvalidMessage(_))
        ));
    }
}
