//! `Deferred<T>` — a one-shot, multi-consumer cell (§4.5 concurrency primitives).
//!
//! Exactly one producer ever calls [`Deferred::complete`]; any number of consumers may
//! call [`Deferred::get`] before or after that happens, and every one of them (including
//! ones that start waiting after completion) observes the same value. An
//! `Arc<Mutex<...>>`-guarded cell notifies every waiter at once via `tokio::sync::Notify`,
//! rather than waking only the first.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::StreamError;

enum State<T> {
    Empty,
    Full(T),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// A cell that can be completed at most once and awaited any number of times.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred { inner: self.inner.clone() }
    }
}

impl<T: Clone> Deferred<T> {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Deferred {
            inner: Arc::new(Inner { state: Mutex::new(State::Empty), notify: Notify::new() }),
        }
    }

    /// Completes the cell. Only the first call has any effect; later calls return `Err`
    /// carrying the value that would have been dropped, mirroring `complete`'s
    /// at-most-once contract rather than panicking on a programming error that concurrent
    /// combinators can legitimately race into (two fibers both finishing "first").
    pub fn complete(&self, value: T) -> Result<(), T> {
        let mut guard = self.inner.state.lock();
        match &*guard {
            State::Full(_) => Err(value),
            State::Empty => {
                *guard = State::Full(value);
                drop(guard);
                self.inner.notify.notify_waiters();
                Ok(())
            }
        }
    }

    /// Waits for the cell to be completed, returning a clone of the value. Resolves
    /// immediately if already completed, even for a `get` that starts long after
    /// `complete` ran.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            if let State::Full(v) = &*self.inner.state.lock() {
                return v.clone();
            }
            notified.await;
        }
    }

    /// Non-blocking peek: `Some` if already completed.
    pub fn try_get(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Full(v) => Some(v.clone()),
            State::Empty => None,
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Deferred::new()
    }
}

/// A `Deferred` specialised to carry the outcome of a fallible computation, the shape
/// `parJoin` and `concurrently` actually need to report a worker fiber's result.
pub type DeferredResult<T> = Deferred<Result<T, StreamError>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_before_complete_resolves_once_completed() {
        let d: Deferred<i32> = Deferred::new();
        let d2 = d.clone();
        let waiter = tokio::spawn(async move { d2.get().await });
        tokio::task::yield_now().await;
        d.complete(42).unwrap();
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn get_after_complete_resolves_immediately() {
        let d: Deferred<i32> = Deferred::new();
        d.complete(7).unwrap();
        assert_eq!(d.get().await, 7);
        assert_eq!(d.try_get(), Some(7));
    }

    #[tokio::test]
    async fn second_complete_is_rejected() {
        let d: Deferred<i32> = Deferred::new();
        assert_eq!(d.complete(1), Ok(()));
        assert_eq!(d.complete(2), Err(2));
        assert_eq!(d.get().await, 1);
    }

    #[tokio::test]
    async fn many_waiters_all_observe_completion() {
        let d: Deferred<i32> = Deferred::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        d.complete(99).unwrap();
        for w in waiters {
            assert_eq!(w.await.unwrap(), 99);
        }
    }
}
