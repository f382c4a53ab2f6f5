//! Length-prefixed framing for channel messages.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. A length of 0 is a
//! valid empty message. Frames carry no type tag: what a payload means is
//! decided by the state the channel is in.
//!
//! [`MessageFramer`] moves one frame across any number of non-blocking reads or
//! writes. [`read_frame`] and [`write_frame`] are the async equivalents for
//! peers talking to a reactor from a tokio task.

use std::io::{self, ErrorKind, Read, Write};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was transferred.
    #[error("connection closed")]
    ConnectionClosed,

    /// A new message was started before the previous one was complete and reset.
    #[error("a {0} is still in progress")]
    MessageInProgress(&'static str),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Idle,
    Reading,
    Writing,
}

impl Direction {
    fn describe(self) -> &'static str {
        match self {
            Direction::Idle => "idle framer",
            Direction::Reading => "message read",
            Direction::Writing => "message write",
        }
    }
}

/// The in-flight message of one channel.
///
/// A framer transfers exactly one message at a time. After
/// [`read_message`](Self::read_message) or [`write_message`](Self::write_message)
/// returned `true`, the message must be consumed with
/// [`take_payload`](Self::take_payload) or dropped with [`reset`](Self::reset)
/// before the next one starts.
#[derive(Debug)]
pub struct MessageFramer {
    config: FrameConfig,
    direction: Direction,
    header: [u8; LENGTH_PREFIX_SIZE],
    header_count: usize,
    payload: Vec<u8>,
    /// Declared payload length.
    size: usize,
    /// Payload bytes transferred so far.
    count: usize,
    complete: bool,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl MessageFramer {
    /// Create an idle framer.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            direction: Direction::Idle,
            header: [0; LENGTH_PREFIX_SIZE],
            header_count: 0,
            payload: Vec::new(),
            size: 0,
            count: 0,
            complete: false,
        }
    }

    /// Read as much of the current incoming message as `src` has available.
    ///
    /// Returns `Ok(true)` once the whole message has arrived, `Ok(false)` when
    /// the source ran dry (`WouldBlock`) first. A complete message stays
    /// complete: further calls return `Ok(true)` without reading, so bytes of
    /// the next message are never consumed into this one.
    pub fn read_message<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<bool, FrameError> {
        match self.direction {
            Direction::Reading if self.complete => return Ok(true),
            Direction::Writing => return Err(FrameError::MessageInProgress("message write")),
            _ => self.direction = Direction::Reading,
        }

        loop {
            if self.header_count < LENGTH_PREFIX_SIZE {
                match read_some(src, &mut self.header[self.header_count..])? {
                    Some(n) => self.header_count += n,
                    None => return Ok(false),
                }
                if self.header_count == LENGTH_PREFIX_SIZE {
                    let declared = u32::from_be_bytes(self.header);
                    if declared > self.config.max_payload_size {
                        return Err(FrameError::PayloadTooLarge {
                            size: u64::from(declared),
                            max: self.config.max_payload_size,
                        });
                    }
                    self.size = declared as usize;
                    self.payload = vec![0; self.size];
                }
                continue;
            }

            if self.count == self.size {
                self.complete = true;
                return Ok(true);
            }

            match read_some(src, &mut self.payload[self.count..])? {
                Some(n) => self.count += n,
                None => return Ok(false),
            }
        }
    }

    /// Queue `payload` as the next outgoing message.
    ///
    /// Fails with [`FrameError::MessageInProgress`] unless the framer is idle.
    pub fn start_write(&mut self, payload: Vec<u8>) -> Result<(), FrameError> {
        if self.direction != Direction::Idle {
            return Err(FrameError::MessageInProgress(self.direction.describe()));
        }
        if payload.len() > self.config.max_payload_size as usize {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len() as u64,
                max: self.config.max_payload_size,
            });
        }
        self.direction = Direction::Writing;
        self.header = (payload.len() as u32).to_be_bytes();
        self.header_count = 0;
        self.size = payload.len();
        self.count = 0;
        self.payload = payload;
        self.complete = false;
        Ok(())
    }

    /// Write as much of the queued message as `dst` accepts.
    ///
    /// Returns `Ok(true)` once every byte was written and flushed, `Ok(false)`
    /// when the sink would block first.
    pub fn write_message<W: Write + ?Sized>(&mut self, dst: &mut W) -> Result<bool, FrameError> {
        match self.direction {
            Direction::Writing if self.complete => return Ok(true),
            Direction::Writing => {}
            other => return Err(FrameError::MessageInProgress(other.describe())),
        }

        while self.header_count < LENGTH_PREFIX_SIZE {
            match write_some(dst, &self.header[self.header_count..])? {
                Some(n) => self.header_count += n,
                None => return Ok(false),
            }
        }
        while self.count < self.size {
            match write_some(dst, &self.payload[self.count..])? {
                Some(n) => self.count += n,
                None => return Ok(false),
            }
        }
        match dst.flush() {
            Ok(()) => {
                self.complete = true;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the current message has been fully transferred.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether a read or write is under way or awaiting reset.
    pub fn is_idle(&self) -> bool {
        self.direction == Direction::Idle
    }

    /// Declared length of the current message.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload bytes of the current message transferred so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Payload of the current message, complete or not.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.count.min(self.payload.len())]
    }

    /// Take the payload of a completely read message and reset the framer.
    ///
    /// Returns `None` if no read has completed.
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        if self.direction != Direction::Reading || !self.complete {
            return None;
        }
        let payload = std::mem::take(&mut self.payload);
        self.reset();
        Some(payload)
    }

    /// Discard the current message and return to idle.
    pub fn reset(&mut self) {
        self.direction = Direction::Idle;
        self.header = [0; LENGTH_PREFIX_SIZE];
        self.header_count = 0;
        self.payload = Vec::new();
        self.size = 0;
        self.count = 0;
        self.complete = false;
    }
}

/// One read; `None` means no data yet.
fn read_some<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> Result<Option<usize>, FrameError> {
    loop {
        match src.read(buf) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One write; `None` means the sink is full.
fn write_some<W: Write + ?Sized>(dst: &mut W, buf: &[u8]) -> Result<Option<usize>, FrameError> {
    loop {
        match dst.write(buf) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read a single length-prefixed frame from an async stream.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let payload_len = u32::from_be_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: u64::from(payload_len),
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(payload)
}

/// Write a single length-prefixed frame to an async stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    if payload.len() > config.max_payload_size as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len() as u64,
            max: config.max_payload_size,
        });
    }

    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}
