//! Byte sources and sinks underneath the message framer.
//!
//! A plain channel frames directly on its socket. A secure channel frames on a
//! [`SecureTransport`], which passes every byte through a [`CipherEngine`];
//! the framer cannot tell the two apart. Both report the number of bytes
//! moved on the socket itself, which for secure channels differs from the
//! payload byte count.

use std::io::{self, ErrorKind, Read, Write};

use mio::net::TcpStream;

/// Size of the scratch buffer for socket reads.
const NETWORK_READ_CHUNK: usize = 16 * 1024;

/// Encrypt/decrypt engine of a secure channel.
///
/// The engine owns its record format: [`seal`](Self::seal) appends one or
/// more records to the network buffer, [`open`](Self::open) consumes every
/// complete record at the front of `network` and appends the plaintext.
pub trait CipherEngine: Send {
    /// Encrypt `plain` and append the resulting records to `network`.
    fn seal(&mut self, plain: &[u8], network: &mut Vec<u8>) -> io::Result<()>;

    /// Decrypt the complete records at the front of `network` into `plain`,
    /// leaving any incomplete trailing record in place.
    fn open(&mut self, network: &mut Vec<u8>, plain: &mut Vec<u8>) -> io::Result<()>;
}

/// Non-blocking adapter running a [`CipherEngine`] over a byte stream.
pub struct SecureTransport<S = TcpStream> {
    stream: S,
    engine: Box<dyn CipherEngine>,
    inbound_network: Vec<u8>,
    inbound_plain: Vec<u8>,
    outbound_network: Vec<u8>,
    outbound_offset: usize,
    network_bytes: u64,
}

impl<S: Read + Write> SecureTransport<S> {
    /// Wrap `stream` with `engine`.
    pub fn new(stream: S, engine: Box<dyn CipherEngine>) -> Self {
        Self {
            stream,
            engine,
            inbound_network: Vec::new(),
            inbound_plain: Vec::new(),
            outbound_network: Vec::new(),
            outbound_offset: 0,
            network_bytes: 0,
        }
    }

    /// Bytes moved on the underlying stream in either direction.
    pub fn network_bytes(&self) -> u64 {
        self.network_bytes
    }

    /// Whether decrypted bytes are waiting to be read.
    ///
    /// The socket will not signal readiness for them again.
    pub fn has_buffered_input(&self) -> bool {
        !self.inbound_plain.is_empty()
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// The wrapped stream, mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Push pending records to the stream; `WouldBlock` if some remain.
    fn drain_outbound(&mut self) -> io::Result<()> {
        while self.outbound_offset < self.outbound_network.len() {
            match self
                .stream
                .write(&self.outbound_network[self.outbound_offset..])
            {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound_offset += n;
                    self.network_bytes += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.outbound_network.clear();
        self.outbound_offset = 0;
        Ok(())
    }
}

impl<S: Read + Write> Read for SecureTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunk = [0u8; NETWORK_READ_CHUNK];
        loop {
            if !self.inbound_plain.is_empty() {
                let n = buf.len().min(self.inbound_plain.len());
                buf[..n].copy_from_slice(&self.inbound_plain[..n]);
                self.inbound_plain.drain(..n);
                return Ok(n);
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(0);
            }
            self.network_bytes += n as u64;
            self.inbound_network.extend_from_slice(&chunk[..n]);
            self.engine
                .open(&mut self.inbound_network, &mut self.inbound_plain)?;
        }
    }
}

impl<S: Read + Write> Write for SecureTransport<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Records already sealed go out first; new plaintext waits behind them.
        self.drain_outbound()?;
        self.engine.seal(buf, &mut self.outbound_network)?;
        match self.drain_outbound() {
            Ok(()) => Ok(buf.len()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(buf.len()),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_outbound()?;
        self.stream.flush()
    }
}

/// The socket of a channel, plain or wrapped in a cipher engine.
pub struct ChannelTransport {
    kind: TransportKind,
    plain_bytes: u64,
}

enum TransportKind {
    Plain(TcpStream),
    Secure(SecureTransport<TcpStream>),
}

impl ChannelTransport {
    /// A transport framing directly on `stream`.
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            kind: TransportKind::Plain(stream),
            plain_bytes: 0,
        }
    }

    /// A transport framing through `engine` on `stream`.
    pub fn secure(stream: TcpStream, engine: Box<dyn CipherEngine>) -> Self {
        Self {
            kind: TransportKind::Secure(SecureTransport::new(stream, engine)),
            plain_bytes: 0,
        }
    }

    /// Whether the transport encrypts.
    pub fn is_secure(&self) -> bool {
        matches!(self.kind, TransportKind::Secure(_))
    }

    /// Bytes moved on the socket in either direction.
    pub fn transferred(&self) -> u64 {
        match &self.kind {
            TransportKind::Plain(_) => self.plain_bytes,
            TransportKind::Secure(secure) => secure.network_bytes(),
        }
    }

    /// Whether bytes were already pulled off the socket but not yet read.
    pub fn has_buffered_input(&self) -> bool {
        match &self.kind {
            TransportKind::Plain(_) => false,
            TransportKind::Secure(secure) => secure.has_buffered_input(),
        }
    }

    /// The socket, for registration with the poller.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match &mut self.kind {
            TransportKind::Plain(stream) => stream,
            TransportKind::Secure(secure) => secure.get_mut(),
        }
    }

    /// The socket.
    pub fn stream(&self) -> &TcpStream {
        match &self.kind {
            TransportKind::Plain(stream) => stream,
            TransportKind::Secure(secure) => secure.get_ref(),
        }
    }
}

impl Read for ChannelTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            TransportKind::Plain(stream) => {
                let n = stream.read(buf)?;
                self.plain_bytes += n as u64;
                Ok(n)
            }
            TransportKind::Secure(secure) => secure.read(buf),
        }
    }
}

impl Write for ChannelTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.kind {
            TransportKind::Plain(stream) => {
                let n = stream.write(buf)?;
                self.plain_bytes += n as u64;
                Ok(n)
            }
            TransportKind::Secure(secure) => secure.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.kind {
            TransportKind::Plain(stream) => stream.flush(),
            TransportKind::Secure(secure) => secure.flush(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::framing::MessageFramer;
    use crate::framing::tests::ChunkedPipe;

    /// Toy engine: 2-byte big-endian record length, then the bytes XOR-ed.
    pub(crate) struct XorEngine(pub(crate) u8);

    impl CipherEngine for XorEngine {
        fn seal(&mut self, plain: &[u8], network: &mut Vec<u8>) -> io::Result<()> {
            for record in plain.chunks(u16::MAX as usize) {
                network.extend_from_slice(&(record.len() as u16).to_be_bytes());
                network.extend(record.iter().map(|b| b ^ self.0));
            }
            Ok(())
        }

        fn open(&mut self, network: &mut Vec<u8>, plain: &mut Vec<u8>) -> io::Result<()> {
            let mut pos = 0;
            while network.len() - pos >= 2 {
                let len = u16::from_be_bytes([network[pos], network[pos + 1]]) as usize;
                if network.len() - pos - 2 < len {
                    break;
                }
                plain.extend(network[pos + 2..pos + 2 + len].iter().map(|b| b ^ self.0));
                pos += 2 + len;
            }
            network.drain(..pos);
            Ok(())
        }
    }

    #[test]
    fn test_secure_framing_matches_plain_framing() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 200) as u8).collect();

        let mut writer = MessageFramer::default();
        writer.start_write(payload.clone()).unwrap();
        let mut sender =
            SecureTransport::new(ChunkedPipe::new(Vec::new(), 7), Box::new(XorEngine(0x5a)));
        while !writer.write_message(&mut sender).unwrap() {}
        let wire = std::mem::take(&mut sender.get_mut().outbound);
        // Ciphertext differs from the plain frame and carries record overhead.
        assert_ne!(&wire[8..], &payload[..]);
        assert!(sender.network_bytes() > (payload.len() + 4) as u64);

        let mut reader = MessageFramer::default();
        let mut receiver =
            SecureTransport::new(ChunkedPipe::new(wire, 5), Box::new(XorEngine(0x5a)));
        while !reader.read_message(&mut receiver).unwrap() {}
        assert_eq!(reader.take_payload().unwrap(), payload);
        assert_eq!(receiver.network_bytes(), sender.network_bytes());
    }

    #[test]
    fn test_secure_read_waits_for_whole_record() {
        let mut sealed = Vec::new();
        XorEngine(1).seal(b"abc", &mut sealed).unwrap();
        // Hand over everything but the last byte of the record.
        let partial = sealed[..sealed.len() - 1].to_vec();
        let mut transport =
            SecureTransport::new(ChunkedPipe::new(partial, usize::MAX), Box::new(XorEngine(1)));
        let mut buf = [0u8; 8];
        for _ in 0..4 {
            let err = transport.read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WouldBlock);
        }
        assert_eq!(transport.network_bytes(), (sealed.len() - 1) as u64);
    }
}
