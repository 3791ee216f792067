//! Channel primitives.
//!
//! Two shapes are used throughout the relay:
//!
//! - [`chan`]: a low-capacity, closable hand-off queue with one consumer. It
//!   backs every correlated response sequence.
//! - [`SharedStream`]: a fan-out stream where every subscriber observes every
//!   item published after it subscribed. It carries the shared inbound stream
//!   that correlators and the router scan cooperatively, so an item one reader
//!   ignores stays visible to the others. Nothing is dropped for slow readers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Returned when sending on a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanClosed;

impl std::fmt::Display for ChanClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("channel closed")
    }
}

impl std::error::Error for ChanClosed {}

// ============================================================================
// Hand-off channel
// ============================================================================

/// Create a hand-off channel. A capacity of zero is treated as one.
pub fn chan<T>(capacity: usize) -> (ChanSender<T>, ChanReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        ChanSender {
            tx,
            closed: closed.clone(),
        },
        ChanReceiver { rx, closed },
    )
}

pub struct ChanSender<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for ChanSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> ChanSender<T> {
    /// Wait for room and hand the value over.
    pub async fn send(&self, value: T) -> Result<(), ChanClosed> {
        if self.closed.is_cancelled() {
            return Err(ChanClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChanClosed),
            sent = self.tx.send(value) => sent.map_err(|_| ChanClosed),
        }
    }

    /// Close the channel. Pending and future sends fail; the receiver drains
    /// what is already buffered and then ends.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

pub struct ChanReceiver<T> {
    rx: mpsc::Receiver<T>,
    closed: CancellationToken,
}

impl<T> ChanReceiver<T> {
    /// Next item, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            item = self.rx.recv() => item,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    pub fn close(&mut self) {
        self.closed.cancel();
        self.rx.close();
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}

// ============================================================================
// Fan-out stream
// ============================================================================

/// Multi-subscriber stream: each [`Subscription`] receives every item.
///
/// Every subscriber owns an unbounded queue fed by [`SharedStream::publish`],
/// so a slow reader never loses items and never holds up the others. Its
/// backlog grows until it catches up or drops the subscription.
pub struct SharedStream<T> {
    inner: Arc<Mutex<Dispatch<T>>>,
}

struct Dispatch<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> SharedStream<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Dispatch {
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    fn dispatch(&self) -> MutexGuard<'_, Dispatch<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver to every live subscription. Returns how many will see it.
    pub fn publish(&self, item: T) -> usize {
        let mut dispatch = self.dispatch();
        if dispatch.closed {
            return 0;
        }
        // The lock is held across the fan-out so every subscriber sees the
        // same order.
        dispatch
            .subscribers
            .retain(|subscriber| subscriber.send(item.clone()).is_ok());
        dispatch.subscribers.len()
    }

    /// Observe every item published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut dispatch = self.dispatch();
        if !dispatch.closed {
            dispatch.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// End every subscription once it has drained.
    pub fn close(&self) {
        let mut dispatch = self.dispatch();
        dispatch.closed = true;
        dispatch.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.dispatch().closed
    }

    pub fn subscriber_count(&self) -> usize {
        let mut dispatch = self.dispatch();
        dispatch.subscribers.retain(|subscriber| !subscriber.is_closed());
        dispatch.subscribers.len()
    }
}

impl<T: Clone> Default for SharedStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next item in publish order, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Items published but not yet received.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.recv().await?;
            Some((item, sub))
        })
    }
}
