//! Socket options of reactor listeners and channels.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, SockRef, Socket, Type};

/// Backlog of every listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking listener on `addr`.
///
/// Sets `SO_REUSEADDR` and, when given, the receive buffer size inherited by
/// accepted sockets.
pub(crate) fn create_listener(
    addr: SocketAddr,
    buffer_size: Option<usize>,
) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Some(size) = buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

/// Apply `TCP_NODELAY` and the buffer sizes to a channel socket.
pub(crate) fn configure_stream(stream: &TcpStream, buffer_size: Option<usize>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if let Some(size) = buffer_size {
        let sock_ref = SockRef::from(stream);
        sock_ref.set_send_buffer_size(size)?;
        sock_ref.set_recv_buffer_size(size)?;
    }
    Ok(())
}
