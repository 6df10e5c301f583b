//! `BoundedQueue<T>` — the transport underneath `parJoin`'s output, `Topic` subscribers,
//! and `PubSub` generally (§4.5).
//!
//! Built on `tokio::sync::mpsc` plus an explicit `Semaphore`, since `close` needs
//! drain-then-fail semantics `mpsc` alone doesn't give: once closed, a queue first lets
//! existing buffered elements drain out through `take`, then every further `take`
//! observes `None` and every further `offer` fails immediately, rather than
//! `mpsc::Receiver` silently returning `None` the instant the last sender drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::error::StreamError;

/// A bounded (or unbounded, via [`BoundedQueue::unbounded`]) multi-producer
/// multi-consumer FIFO with explicit closing.
///
/// `tx` is held behind `Option` so `close` can drop it: `mpsc::UnboundedReceiver::recv`
/// only ever reports end-of-stream once every sender clone is gone, so a queue that never
/// dropped its own retained sender would have `take` block forever past the last buffered
/// element instead of observing the close.
pub struct BoundedQueue<T> {
    tx: SyncMutex<Option<mpsc::UnboundedSender<T>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    permits: Option<Arc<Semaphore>>,
    closed: Arc<AtomicBool>,
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Capacity-limited queue: `offer` blocks (yielding to other fibers) once `capacity`
    /// elements are buffered.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        BoundedQueue {
            tx: SyncMutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            permits: Some(Arc::new(Semaphore::new(capacity.max(1)))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Unbounded queue: `offer` never blocks on capacity (used for control-plane
    /// channels where backpressure would be a protocol error, e.g. interrupt signalling).
    pub fn unbounded() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        BoundedQueue {
            tx: SyncMutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            permits: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueues `value`, waiting for capacity if bounded. Fails if the queue has been
    /// closed.
    pub async fn offer(&self, value: T) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::msg("offer on a closed queue"));
        }
        let _permit = if let Some(sem) = &self.permits {
            match sem.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => return Err(StreamError::msg("offer on a closed queue")),
            }
        } else {
            None
        };
        let sender = self.tx.lock().clone();
        match sender {
            Some(tx) => tx.send(value).map_err(|_| {
                warn!("offer landed on a queue whose receiver side is gone, ignoring");
                StreamError::msg("offer on a closed queue")
            }),
            None => Err(StreamError::msg("offer on a closed queue")),
        }
    }

    /// Dequeues the next value, or `None` once the queue is closed and drained.
    pub async fn take(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let value = rx.recv().await;
        if let Some(sem) = &self.permits {
            sem.add_permits(1);
        }
        value
    }

    /// Marks the queue closed: buffered elements still drain via `take`, but every
    /// further `offer` fails, and `take` reports `None` once every buffered element has
    /// drained. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(sem) = &self.permits {
                sem.close();
            }
            self.tx.lock().take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = BoundedQueue::bounded(4);
        for i in 0..4 {
            q.offer(i).await.unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.take().await, Some(i));
        }
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let q = BoundedQueue::bounded(4);
        q.offer(1).await.unwrap();
        q.offer(2).await.unwrap();
        q.close();
        assert!(q.offer(3).await.is_err());
        assert_eq!(q.take().await, Some(1));
        assert_eq!(q.take().await, Some(2));
        assert_eq!(q.take().await, None);
    }

    #[tokio::test]
    async fn bounded_backpressure_releases_on_take() {
        let q = Arc::new(BoundedQueue::bounded(1));
        q.offer(1).await.unwrap();
        let q2 = q.clone();
        let offerer = tokio::spawn(async move { q2.offer(2).await });
        tokio::task::yield_now().await;
        assert!(!offerer.is_finished());
        assert_eq!(q.take().await, Some(1));
        offerer.await.unwrap().unwrap();
        assert_eq!(q.take().await, Some(2));
    }
}
