//! Zero-capacity handoff between one producer and many consumers.
//!
//! A consumer registers a one-shot reply slot and waits on it; the producer
//! only parts with a value once it has a live slot to put it in. Nothing is
//! ever buffered, so a value is either in the producer's hands or delivered
//! to exactly one consumer. A consumer that stops waiting after the value
//! landed in its slot sends it back to the producer.

use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::cancel::CancelSignal;

type Reply<T> = oneshot::Sender<T>;

/// Create a connected producer/consumer pair
pub(crate) fn rendezvous<T>() -> (Offerer<T>, Taker<T>) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (return_tx, return_rx) = mpsc::unbounded_channel();
    (
        Offerer {
            requests: request_rx,
            returns: return_rx,
            waiters: VecDeque::new(),
        },
        Taker {
            requests: request_tx,
            returns: return_tx,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TakeError {
    /// The deadline passed before a value was handed over
    Timeout,
    /// The producer is gone
    Disconnected,
}

/// Consumer side; shared by every caller of the listener
#[derive(Debug)]
pub(crate) struct Taker<T> {
    requests: mpsc::UnboundedSender<Reply<T>>,
    returns: mpsc::UnboundedSender<T>,
}

impl<T> Taker<T> {
    /// Wait for the next value, giving up at `deadline` if one is set.
    ///
    /// A value that is handed over while the timer fires is still returned.
    /// Dropping the future never loses a value: one that already reached the
    /// reply slot goes back to the producer.
    pub(crate) async fn take(&self, deadline: Option<Instant>) -> Result<T, TakeError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(reply)
            .map_err(|_| TakeError::Disconnected)?;

        let mut pending = PendingTake {
            response,
            returns: &self.returns,
        };

        let Some(deadline) = deadline else {
            return (&mut pending.response)
                .await
                .map_err(|_| TakeError::Disconnected);
        };

        tokio::select! {
            biased;
            value = &mut pending.response => value.map_err(|_| TakeError::Disconnected),
            _ = tokio::time::sleep_until(deadline) => {
                pending.response.close();
                pending.response.try_recv().map_err(|_| TakeError::Timeout)
            }
        }
    }
}

/// Reply slot of a `take` in progress
struct PendingTake<'a, T> {
    response: oneshot::Receiver<T>,
    returns: &'a mpsc::UnboundedSender<T>,
}

impl<T> Drop for PendingTake<'_, T> {
    fn drop(&mut self) {
        // Closing first makes a racing `send` fail, so the producer keeps
        // the value; anything already in the slot is sent back.
        self.response.close();
        if let Ok(value) = self.response.try_recv() {
            let _ = self.returns.send(value);
        }
    }
}

/// Result of offering a value
#[derive(Debug)]
pub(crate) enum Offer<T> {
    Taken,
    /// No consumer took it before shutdown; ownership returns to the producer
    Abandoned(T),
}

/// How `absorb_while` finished
#[derive(Debug)]
pub(crate) enum Absorbed<O, T> {
    /// The work completed
    Done(O),
    /// A consumer sent a value back before the work completed
    Returned(T),
}

/// Producer side; owned by the accept pump
#[derive(Debug)]
pub(crate) struct Offerer<T> {
    requests: mpsc::UnboundedReceiver<Reply<T>>,
    returns: mpsc::UnboundedReceiver<T>,
    waiters: VecDeque<Reply<T>>,
}

impl<T> Offerer<T> {
    /// Drive `work` while queueing consumers that show up.
    ///
    /// Returns early with a value sent back by a consumer; `work` is left
    /// untouched and can be passed in again. Consumers that already gave up
    /// are pruned on every arrival, so the queue only holds callers that are
    /// still waiting.
    pub(crate) async fn absorb_while<F>(&mut self, work: &mut F) -> Absorbed<F::Output, T>
    where
        F: Future + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                output = &mut *work => return Absorbed::Done(output),
                Some(value) = self.returns.recv() => return Absorbed::Returned(value),
                Some(reply) = self.requests.recv() => self.enqueue(reply),
            }
        }
    }

    /// Take a value a consumer sent back, if any
    pub(crate) fn reclaim(&mut self) -> Option<T> {
        self.returns.try_recv().ok()
    }

    /// Hand `value` to the oldest live consumer, waiting for one if needed.
    pub(crate) async fn offer(&mut self, value: T, done: &CancelSignal) -> Offer<T> {
        let mut value = value;
        loop {
            let reply = match self.waiters.pop_front() {
                Some(reply) => reply,
                None => tokio::select! {
                    biased;
                    request = self.requests.recv() => match request {
                        Some(reply) => reply,
                        None => return Offer::Abandoned(value),
                    },
                    _ = done.cancelled() => return Offer::Abandoned(value),
                },
            };

            match reply.send(value) {
                Ok(()) => return Offer::Taken,
                // consumer timed out or went away; try the next one
                Err(back) => value = back,
            }
        }
    }

    fn enqueue(&mut self, reply: Reply<T>) {
        self.waiters.retain(|waiter| !waiter.is_closed());
        self.waiters.push_back(reply);
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.waiters.len()
    }
}
