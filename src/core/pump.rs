use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::cancel::CancelSignal;
use super::metrics::ListenerMetrics;
use super::rendezvous::{Absorbed, Offer, Offerer};
use super::transport::RawListener;

/// One result of the underlying accept call
#[derive(Debug)]
pub(crate) enum Outcome<C> {
    Accepted(C),
    Failed {
        error: Arc<io::Error>,
        temporary: bool,
    },
}

/// Slot for the error that stopped the pump
pub(crate) type TerminalError = Arc<OnceLock<Arc<io::Error>>>;

type PendingAccept<C> = JoinHandle<io::Result<C>>;

/// Background task that keeps calling the blocking accept and hands each
/// result to exactly one waiting caller.
///
/// It is the only caller of `RawListener::accept`. It stops after handing
/// over an error, or when `done` fires while it holds an undelivered result.
/// Results sent back by callers that stopped waiting are offered again
/// before the next accepted one.
pub(crate) struct AcceptPump<L: RawListener> {
    listener: Arc<L>,
    offerer: Offerer<Outcome<L::Conn>>,
    done: CancelSignal,
    terminal: TerminalError,
    metrics: Arc<ListenerMetrics>,
    pending: Option<PendingAccept<L::Conn>>,
}

impl<L: RawListener> AcceptPump<L> {
    pub(crate) fn new(
        listener: Arc<L>,
        offerer: Offerer<Outcome<L::Conn>>,
        done: CancelSignal,
        terminal: TerminalError,
        metrics: Arc<ListenerMetrics>,
    ) -> Self {
        Self {
            listener,
            offerer,
            done,
            terminal,
            metrics,
            pending: None,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let addr = self.listener.addr();
        debug!("Accept pump started for {}", addr);

        loop {
            let outcome = self.next_outcome().await;
            let failed = match &outcome {
                Outcome::Accepted(_) => false,
                Outcome::Failed { error, .. } => {
                    let _ = self.terminal.set(Arc::clone(error));
                    true
                }
            };

            match self.offerer.offer(outcome, &self.done).await {
                Offer::Taken => self.metrics.record_delivered(),
                Offer::Abandoned(outcome) => {
                    self.abandon(addr, outcome);
                    break;
                }
            }

            if failed {
                break;
            }
        }

        // The transport is closed by now, so a running accept returns soon
        if let Some(accept) = self.pending.take() {
            if let Ok(Ok(conn)) = accept.await {
                self.metrics.record_accepted();
                self.abandon(addr, Outcome::Accepted(conn));
            }
        }
        while let Some(outcome) = self.offerer.reclaim() {
            self.abandon(addr, outcome);
        }

        debug!("Accept pump for {} stopped", addr);
    }

    /// Next result to offer: one sent back by a caller, otherwise the result
    /// of a blocking accept run on the blocking pool
    async fn next_outcome(&mut self) -> Outcome<L::Conn> {
        if let Some(outcome) = self.offerer.reclaim() {
            return self.reoffer(outcome);
        }

        let mut accept = match self.pending.take() {
            Some(accept) => accept,
            None => {
                let listener = Arc::clone(&self.listener);
                tokio::task::spawn_blocking(move || listener.accept())
            }
        };

        let result = match self.offerer.absorb_while(&mut accept).await {
            Absorbed::Done(Ok(result)) => result,
            Absorbed::Done(Err(e)) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("accept task failed: {}", e),
            )),
            Absorbed::Returned(outcome) => {
                // the accept keeps running; its result is picked up next time
                self.pending = Some(accept);
                return self.reoffer(outcome);
            }
        };

        match result {
            Ok(conn) => {
                self.metrics.record_accepted();
                Outcome::Accepted(conn)
            }
            Err(e) => {
                self.metrics.record_accept_error();
                let temporary = self.listener.is_temporary(&e);
                if temporary {
                    warn!("Temporary accept error on {}: {}", self.listener.addr(), e);
                } else {
                    error!("Accept failed on {}: {}", self.listener.addr(), e);
                }
                Outcome::Failed {
                    error: Arc::new(e),
                    temporary,
                }
            }
        }
    }

    fn reoffer(&self, outcome: Outcome<L::Conn>) -> Outcome<L::Conn> {
        self.metrics.record_returned();
        debug!(
            "Result on {} sent back by a caller that stopped waiting",
            self.listener.addr()
        );
        outcome
    }

    /// Nobody took the result before shutdown. The connection is dropped,
    /// which closes it.
    fn abandon(&self, addr: SocketAddr, outcome: Outcome<L::Conn>) {
        self.metrics.record_abandoned();
        match outcome {
            Outcome::Accepted(conn) => {
                debug!("Closing connection accepted on {} after shutdown", addr);
                drop(conn);
            }
            Outcome::Failed { error, .. } => {
                debug!("Discarding accept error on {} after shutdown: {}", addr, error);
            }
        }
    }
}
