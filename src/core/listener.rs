use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cancel::{CancelReason, CancelSignal, CancelSource};
use super::metrics::{ListenerMetrics, MetricsSnapshot};
use super::pump::{AcceptPump, Outcome, TerminalError};
use super::rendezvous::{rendezvous, TakeError, Taker};
use super::transport::{Family, RawListener, Transport};

/// Grace period handed to the transport on `close` unless overridden
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Listener with cancellable, deadline-bounded accepts on top of a blocking
/// accept primitive.
///
/// A background pump task owns the only call site of the transport's
/// `accept`. Callers claim its results through `accept_until`, `accept` or
/// `accept_with_cancel`; each result goes to exactly one caller.
///
/// The deadline stored by `set_deadline` is shared by every caller of
/// `accept` (last write wins). Keep a single writer, or pass the deadline
/// explicitly with `accept_until`.
pub struct HeartbeatListener<L: RawListener> {
    listener: Arc<L>,
    heartbeat: Duration,
    close_grace: Duration,
    done: CancelSource,
    taker: Taker<Outcome<L::Conn>>,
    deadline: Mutex<Option<Instant>>,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
    terminal: TerminalError,
    metrics: Arc<ListenerMetrics>,
    closed: AtomicBool,
}

impl<L: RawListener> HeartbeatListener<L> {
    /// Resolve `address`, open a transport listener on it and start the pump
    pub async fn bind<T>(
        transport: &T,
        family: Family,
        address: &str,
        config: T::Config,
        heartbeat: Duration,
    ) -> Result<Self, ListenerError>
    where
        T: Transport<Listener = L>,
    {
        if heartbeat.is_zero() {
            return Err(ListenerError::InvalidHeartbeat);
        }

        let transport = transport.clone();
        let address = address.to_string();
        let listener = tokio::task::spawn_blocking(move || {
            let addr = transport
                .resolve_address(family, &address)
                .map_err(|source| ListenerError::Resolve {
                    address: address.clone(),
                    source,
                })?;
            transport
                .listen(family, addr, &config)
                .map_err(|source| ListenerError::Listen { addr, source })
        })
        .await
        .map_err(|e| ListenerError::Task(e.to_string()))??;

        info!(
            "Listening on {} ({}), heartbeat {:?}",
            listener.addr(),
            family,
            heartbeat
        );

        Self::from_listener(listener, heartbeat)
    }

    /// Wrap an already opened listener and start the pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_listener(listener: L, heartbeat: Duration) -> Result<Self, ListenerError> {
        if heartbeat.is_zero() {
            return Err(ListenerError::InvalidHeartbeat);
        }

        let listener = Arc::new(listener);
        let done = CancelSource::new();
        let (offerer, taker) = rendezvous();
        let terminal: TerminalError = Arc::new(OnceLock::new());
        let metrics = Arc::new(ListenerMetrics::new());

        let pump = AcceptPump::new(
            Arc::clone(&listener),
            offerer,
            done.signal(),
            Arc::clone(&terminal),
            Arc::clone(&metrics),
        )
        .spawn();

        Ok(Self {
            listener,
            heartbeat,
            close_grace: DEFAULT_CLOSE_GRACE,
            done,
            taker,
            deadline: Mutex::new(None),
            pump: AsyncMutex::new(Some(pump)),
            terminal,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Override the grace period handed to the transport on close
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Store the deadline used by the next `accept`. `None` means no deadline.
    ///
    /// Always returns `Ok(())`.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), ListenerError> {
        *self.deadline.lock().unwrap_or_else(|p| p.into_inner()) = deadline;
        Ok(())
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Accept with the deadline last stored by `set_deadline`
    ///
    /// # Cancel safety
    ///
    /// Cancel safe, see `accept_until`.
    pub async fn accept(&self) -> Result<L::Conn, ListenerError> {
        let deadline = self.deadline();
        self.accept_until(deadline).await
    }

    /// Wait for the next connection.
    ///
    /// With `None` this waits until the pump produces a result. With a
    /// deadline it returns `ListenerError::Timeout` once the deadline is
    /// reached; a deadline that already passed times out immediately.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. If the future is dropped, for example in
    /// a `tokio::select!` branch that lost, a connection that was already
    /// handed to it goes back to the pump and is given to the next caller.
    pub async fn accept_until(&self, deadline: Option<Instant>) -> Result<L::Conn, ListenerError> {
        match self.taker.take(deadline).await {
            Ok(Outcome::Accepted(conn)) => Ok(conn),
            Ok(Outcome::Failed { error, temporary }) => Err(ListenerError::Accept {
                source: error,
                temporary,
            }),
            Err(TakeError::Timeout) => {
                self.metrics.record_timeout();
                Err(ListenerError::Timeout)
            }
            Err(TakeError::Disconnected) => Err(self.stopped_error()),
        }
    }

    /// Accept until a connection arrives or `cancel` fires.
    ///
    /// Polls in heartbeat-sized slices and checks `cancel` between slices, so
    /// cancellation is observed within one heartbeat. A graceful cancel
    /// returns `Ok(None)`; any other reason is an error. Temporary errors are
    /// retried and never surface.
    pub async fn accept_with_cancel(
        &self,
        cancel: &CancelSignal,
    ) -> Result<Option<L::Conn>, ListenerError> {
        loop {
            if let Some(reason) = cancel.reason() {
                debug!("Accept on {} cancelled: {}", self.listener.addr(), reason);
                if reason.is_graceful() {
                    return Ok(None);
                }
                return Err(ListenerError::Cancelled(reason));
            }

            let deadline = Instant::now() + self.heartbeat;
            match self.accept_until(Some(deadline)).await {
                Ok(conn) => return Ok(Some(conn)),
                Err(e) if e.is_temporary() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the transport listener, stop the pump and wait for it.
    ///
    /// Pending accepts return instead of hanging. Every call returns only
    /// once the pump has stopped; a call made while another one is in
    /// progress waits for it and then returns `Ok(())`.
    pub async fn close(&self) -> Result<(), ListenerError> {
        // held until the pump is joined so concurrent callers wait for it
        let mut pump = self.pump.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr = self.listener.addr();
        let listener = Arc::clone(&self.listener);
        let grace = self.close_grace;
        let result = tokio::task::spawn_blocking(move || listener.close(grace)).await;

        self.done.cancel();
        if let Some(pump) = pump.take() {
            if let Err(e) = pump.await {
                warn!("Accept pump for {} ended abnormally: {}", addr, e);
            }
        }

        info!("Listener on {} closed", addr);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ListenerError::Close(e)),
            Err(e) => Err(ListenerError::Task(e.to_string())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address the transport listener is bound to
    pub fn addr(&self) -> SocketAddr {
        self.listener.addr()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn stopped_error(&self) -> ListenerError {
        if self.is_closed() {
            return ListenerError::Closed;
        }
        match self.terminal.get() {
            Some(cause) => ListenerError::Terminated(Arc::clone(cause)),
            None => ListenerError::Closed,
        }
    }
}

/// Dropping without `close` closes the transport with a zero grace period,
/// so no handshake wait happens on the dropping thread, and tells the pump to
/// stop without waiting for it.
impl<L: RawListener> Drop for HeartbeatListener<L> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Listener on {} dropped without close", self.listener.addr());
        if let Err(e) = self.listener.close(Duration::ZERO) {
            debug!("Close on drop failed: {}", e);
        }
        self.done.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Heartbeat must be greater than zero")]
    InvalidHeartbeat,
    #[error("Cannot resolve address '{address}': {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Cannot create listener on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("i/o timeout")]
    Timeout,
    #[error("Cannot accept connection: {source}")]
    Accept {
        #[source]
        source: Arc<io::Error>,
        temporary: bool,
    },
    #[error("Accept loop terminated: {0}")]
    Terminated(Arc<io::Error>),
    #[error("Listener closed")]
    Closed,
    #[error("Cannot accept connections: {0}")]
    Cancelled(CancelReason),
    #[error("Close failed: {0}")]
    Close(#[source] io::Error),
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ListenerError {
    /// Whether retrying the accept makes sense
    pub fn is_temporary(&self) -> bool {
        match self {
            ListenerError::Timeout => true,
            ListenerError::Accept { temporary, .. } => *temporary,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ListenerError::Timeout)
    }
}
