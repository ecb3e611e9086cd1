//! Plain TCP implementation of the transport traits.
//!
//! Uses a blocking `std::net::TcpListener` configured through `socket2`, so
//! the accept pump sees the same blocking primitive any other transport
//! would hand it.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use super::transport::{Family, RawListener, Transport};
use crate::config::TransportConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Config = TransportConfig;
    type Listener = TcpListener;

    fn listen(
        &self,
        family: Family,
        addr: SocketAddr,
        config: &TransportConfig,
    ) -> io::Result<TcpListener> {
        TcpListener::bind(family, addr, config)
    }
}

/// Blocking TCP listener whose `close` wakes a pending `accept`
#[derive(Debug)]
pub struct TcpListener {
    inner: std::net::TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
    closed: AtomicBool,
}

impl TcpListener {
    pub fn bind(family: Family, addr: SocketAddr, config: &TransportConfig) -> io::Result<Self> {
        if !family.admits(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not an {} address", addr, family),
            ));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(family == Family::Ipv6)?;
        }
        socket.set_reuse_address(config.reuse_address)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;

        let inner: std::net::TcpListener = socket.into();
        let local_addr = inner.local_addr()?;

        Ok(Self {
            inner,
            local_addr,
            nodelay: config.nodelay,
            closed: AtomicBool::new(false),
        })
    }

    /// Where to connect to reach this listener from the local host
    fn wake_addr(&self) -> SocketAddr {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local_addr.port())
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "listener closed")
    }
}

impl RawListener for TcpListener {
    type Conn = TcpConnection;

    /// Errors that only concern the connection being accepted are retried
    /// here; anything returned is fatal for the listener.
    fn accept(&self) -> io::Result<TcpConnection> {
        let (stream, peer_addr) = accept_retrying(&self.closed, || self.inner.accept())?;
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(TcpConnection { stream, peer_addr })
    }

    /// TCP handshakes complete in the kernel, so `grace` only bounds the
    /// wake-up connect used to release a blocked `accept`.
    fn close(&self, grace: Duration) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // On Linux this alone makes a blocked accept fail
        if let Err(e) = SockRef::from(&self.inner).shutdown(Shutdown::Both) {
            debug!("Shutdown of {} failed: {}", self.local_addr, e);
        }
        if !grace.is_zero() {
            let _ = TcpStream::connect_timeout(&self.wake_addr(), grace);
        }
        Ok(())
    }

    fn addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Run `accept` until it yields a connection or a listener-wide error
fn accept_retrying<T>(
    closed: &AtomicBool,
    mut accept: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    loop {
        let result = accept();
        if closed.load(Ordering::SeqCst) {
            return Err(TcpListener::closed_error());
        }

        match result {
            Ok(accepted) => return Ok(accepted),
            Err(e) if is_connection_error(&e) => {
                debug!("Skipping connection that failed during accept: {}", e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accept errors caused by a single peer, such as a reset before the
/// connection was picked up
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// An accepted TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_std(self) -> TcpStream {
        self.stream
    }

    /// Switch to non-blocking mode and register with the tokio reactor.
    /// Must be called from within a tokio runtime.
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpStream> {
        self.stream.set_nonblocking(true)?;
        tokio::net::TcpStream::from_std(self.stream)
    }
}
