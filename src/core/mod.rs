pub mod cancel;
pub mod listener;
pub mod metrics;
pub mod protocol;
pub mod tcp;
pub mod transport;

mod pump;
mod rendezvous;

// Re-export core types
pub use cancel::{CancelReason, CancelSignal, CancelSource};
pub use listener::{HeartbeatListener, ListenerError, DEFAULT_CLOSE_GRACE};
pub use metrics::{ListenerMetrics, MetricsSnapshot};
pub use protocol::{protocol_by_name, DiscardProtocol, EchoProtocol, Protocol, ProtocolError};
pub use tcp::{TcpConnection, TcpListener, TcpTransport};
pub use transport::{is_temporary, resolve_address, Family, RawListener, Transport};
