use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of listener counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections returned by the transport
    pub accepted: u64,
    /// Errors returned by the transport
    pub accept_errors: u64,
    /// Results handed to a caller
    pub delivered: u64,
    /// Results dropped because the listener shut down first
    pub abandoned: u64,
    /// Accept calls that hit their deadline
    pub timeouts: u64,
    /// Delivered results sent back by a caller that stopped waiting
    pub returned: u64,
}

impl MetricsSnapshot {
    /// Results produced by the pump that are neither delivered nor abandoned
    pub fn in_flight(&self) -> u64 {
        (self.accepted + self.accept_errors + self.returned)
            .saturating_sub(self.delivered + self.abandoned)
    }
}

/// Thread-safe counters shared by the accept pump and the listener
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    delivered: AtomicU64,
    abandoned: AtomicU64,
    timeouts: AtomicU64,
    returned: AtomicU64,
}

impl ListenerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_returned(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters (useful for testing)
    pub fn reset(&self) {
        self.accepted.store(0, Ordering::Relaxed);
        self.accept_errors.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.abandoned.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.returned.store(0, Ordering::Relaxed);
    }
}
