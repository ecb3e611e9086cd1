use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Why a cancellation signal fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Orderly stop requested by the owner; not an error
    Graceful,
    /// The signal's own deadline elapsed
    DeadlineExceeded,
    /// Stopped because something else failed
    Aborted(String),
}

impl CancelReason {
    pub fn is_graceful(&self) -> bool {
        matches!(self, CancelReason::Graceful)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Graceful => write!(f, "cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Aborted(cause) => write!(f, "aborted: {}", cause),
        }
    }
}

/// Triggering side of a broadcast-once cancellation.
///
/// Clones share the same state. The first `cancel*` call wins; later calls
/// are ignored so the observed reason never changes once set.
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Get an observer for this source
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire with `CancelReason::Graceful`
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Graceful)
    }

    /// Fire with an explicit reason. Returns false if already fired.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Fire with `CancelReason::DeadlineExceeded` once `after` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_after(&self, after: Duration) {
        let source = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            source.cancel_with(CancelReason::DeadlineExceeded);
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a `CancelSource`
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        CancelSource::new().signal()
    }

    /// The reason, if the signal already fired
    pub fn reason(&self) -> Option<CancelReason> {
        self.rx.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until the signal fires.
    ///
    /// Pends forever if every `CancelSource` is dropped without firing.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        let result = rx.wait_for(|reason| reason.is_some()).await.map(|r| (*r).clone());
        match result {
            Ok(Some(reason)) => reason,
            _ => std::future::pending().await,
        }
    }
}
