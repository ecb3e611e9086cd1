use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Address family a listener is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Either family; IPv6 sockets also accept IPv4-mapped peers
    #[default]
    #[serde(alias = "tcp", alias = "udp")]
    Dual,
    #[serde(alias = "tcp4", alias = "udp4")]
    Ipv4,
    #[serde(alias = "tcp6", alias = "udp6")]
    Ipv6,
}

impl Family {
    /// Check whether an address belongs to this family
    pub fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::Dual => true,
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Dual => "dual",
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
        };
        f.write_str(name)
    }
}

impl FromStr for Family {
    type Err = String;

    /// Accepts the family names as well as network names such as `udp4`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dual" | "tcp" | "udp" => Ok(Family::Dual),
            "ipv4" | "tcp4" | "udp4" => Ok(Family::Ipv4),
            "ipv6" | "tcp6" | "udp6" => Ok(Family::Ipv6),
            other => Err(format!("unknown network family '{}'", other)),
        }
    }
}

/// A transport able to open blocking listeners
pub trait Transport: Clone + Send + Sync + 'static {
    /// Transport specific settings, opaque to the accept adapter
    type Config: Clone + Send + Sync + 'static;
    type Listener: RawListener;

    /// Resolve a bind address string for the given family
    fn resolve_address(&self, family: Family, address: &str) -> io::Result<SocketAddr> {
        resolve_address(family, address)
    }

    /// Open a listener bound to `addr`
    fn listen(
        &self,
        family: Family,
        addr: SocketAddr,
        config: &Self::Config,
    ) -> io::Result<Self::Listener>;
}

/// Blocking accept primitive wrapped by `HeartbeatListener`.
///
/// `accept` may block indefinitely and cannot be cancelled; `close` must make
/// a blocked `accept` return.
pub trait RawListener: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn accept(&self) -> io::Result<Self::Conn>;

    /// Close the listener, giving in-flight handshakes up to `grace`.
    /// Called with a zero `grace` from `Drop`, where it must not block.
    fn close(&self, grace: Duration) -> io::Result<()>;

    fn addr(&self) -> SocketAddr;

    /// Whether an accept error is worth retrying
    fn is_temporary(&self, err: &io::Error) -> bool {
        is_temporary(err)
    }
}

/// Default classification of transient I/O errors
pub fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Resolve `host:port` to the first address of the requested family
pub fn resolve_address(family: Family, address: &str) -> io::Result<SocketAddr> {
    address
        .to_socket_addrs()?
        .find(|addr| family.admits(addr))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address found for '{}'", family, address),
            )
        })
}
