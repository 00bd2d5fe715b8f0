use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// Backlog used for sockets handed to child processes
const LISTEN_BACKLOG: i32 = 100;

/// A listening socket bound to an ephemeral port, meant to be inherited by a child
/// process by descriptor number.
///
/// The socket keeps close-on-exec set; the launcher clears it in the child only (see
/// [`LaunchOptions::inherit_fd`](crate::core::process::LaunchOptions::inherit_fd)).
#[derive(Debug)]
pub struct ListenSocket {
    socket: Socket,
    port: u16,
}

impl ListenSocket {
    /// Bind a dual-stack IPv6 socket on an ephemeral port, falling back to IPv4 when
    /// IPv6 is unavailable.
    pub fn bind_ephemeral() -> io::Result<Self> {
        let socket = match Self::bind_v6() {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("IPv6 listen socket unavailable ({}), using IPv4", e);
                Self::bind_v4()?
            }
        };
        socket.listen(LISTEN_BACKLOG)?;

        let port = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "listen socket has no port"))?;

        Ok(Self { socket, port })
    }

    fn bind_v6() -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, None)?;
        socket.set_only_v6(false)?;
        socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
        Ok(socket)
    }

    fn bind_v4() -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        Ok(socket)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Close the parent's copy once the child holds its own
    pub fn close(self) {
        drop(self.socket);
    }
}
