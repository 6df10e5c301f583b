//! The effect capability set (§2 item 2, §5.1). Rust has no `F[_]`; this crate reifies
//! the capability bundle an effect algebra passes around implicitly (`delay`,
//! `raiseError`, `attempt`, `uncancelable`, `start`/`join`/`cancel`, `ref`, `deferred`) as
//! one object-safe trait plus a concrete `tokio`-backed implementation, an object-safe
//! spawn capability in the shape of a `spawn_obj`/`child` pair, with a builder-configured
//! `Runtime` rather than a constructor with positional arguments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{ExitCase, StreamError};

/// A running fiber. `cancel` never kills it abruptly (§5): it aborts the underlying task
/// and the fiber observes the abort as [`ExitCase::Canceled`] the next time it would have
/// yielded, same as scope interruption does for ordinary stream evaluation.
pub struct Fiber {
    handle: tokio::task::JoinHandle<()>,
}

impl Fiber {
    /// Waits for the fiber to finish, translating an abort into `ExitCase::Canceled`
    /// rather than propagating a `JoinError` as a `StreamError` — cancellation is not a
    /// user-visible failure (§7).
    pub async fn join(self) -> ExitCase {
        match self.handle.await {
            Ok(()) => ExitCase::Succeeded,
            Err(e) if e.is_cancelled() => ExitCase::Canceled,
            Err(e) => ExitCase::Failed(StreamError::msg(format!("fiber panicked: {e}"))),
        }
    }

    /// Requests cancellation without waiting for it to take effect.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// The capability bundle a compiled stream runs against. Every suspension point in the
/// interpreter (`Eval`, `Acquire`, queue `offer`/`take`, `Deferred::get`) ultimately
/// bottoms out in ordinary `.await`; what a `Runtime` supplies beyond that is *forking* —
/// the one thing `parJoin`, `concurrently`, `observe`, and `interruptWhen` need that a
/// bare `Future` cannot do for itself.
#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    /// Forks `fut` onto a new fiber and returns a handle to it.
    fn spawn(&self, fut: BoxFuture<'static, ()>) -> Fiber;

    /// Suspends the current fiber for `dur`. Used to build `interruptWhen`-based
    /// timeouts (§5, last paragraph) without baking a timer into the core algebra.
    async fn sleep(&self, dur: Duration);

    /// Whether this runtime can spawn fibers at all. `translate` (§4.4, §5.1) consults
    /// this before moving a sub-stream that opened an interruptible scope onto a new
    /// runtime; a runtime that can't spawn can't host `interruptWhen`'s watcher fiber.
    fn supports_interrupt(&self) -> bool {
        true
    }
}

/// Runs `fut` to completion, discarding any interrupt race: used internally by `Acquire`,
/// whose in-flight resource acquisition must never be abandoned mid-flight even though
/// its *registration* may still race an ambient interrupt (§4.2).
pub(crate) async fn uncancelable<T>(fut: impl Future<Output = T>) -> T {
    fut.await
}

/// The one concrete `Runtime` shipped by this crate, built on `tokio`.
pub struct TokioRuntime {
    handle: tokio::runtime::Handle,
}

impl TokioRuntime {
    /// Captures the ambient `tokio` runtime handle. Panics (like `Handle::current`
    /// itself) if called outside a `tokio` runtime context — deliberately fail-fast
    /// rather than silently no-op (a no-op spawner would make `parJoin` hang forever
    /// instead of failing loudly).
    pub fn current() -> Self {
        TokioRuntime { handle: tokio::runtime::Handle::current() }
    }

    /// Builds a `Runtime` from an explicit handle, for embedders that already manage
    /// their own `tokio` runtime.
    pub fn from_handle(handle: tokio::runtime::Handle) -> Self {
        TokioRuntime { handle }
    }
}

#[async_trait]
impl Runtime for TokioRuntime {
    fn spawn(&self, fut: BoxFuture<'static, ()>) -> Fiber {
        Fiber { handle: self.handle.spawn(fut) }
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Builder for the knobs that matter to the interpreter and concurrent combinators,
/// favoring a fluent builder style over a constructor with positional arguments.
pub struct RuntimeConfig {
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) default_queue_capacity: usize,
    pub(crate) default_chunk_limit: usize,
    pub(crate) span: Option<tracing::Span>,
}

impl RuntimeConfig {
    /// Starts from the default `TokioRuntime`, captured from the ambient `tokio` context.
    pub fn new() -> Self {
        RuntimeConfig {
            runtime: Arc::new(TokioRuntime::current()),
            default_queue_capacity: 16,
            default_chunk_limit: 1024,
            span: None,
        }
    }

    /// Substitutes a custom capability implementation.
    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Default capacity for queues this crate creates on the caller's behalf (e.g.
    /// `parJoin`'s output queue, `Topic` subscriber queues) when not given an explicit
    /// one.
    pub fn with_default_queue_capacity(mut self, capacity: usize) -> Self {
        self.default_queue_capacity = capacity.max(1);
        self
    }

    /// Default `chunkLimit` applied where a combinator needs one but the caller hasn't
    /// specified it.
    pub fn with_default_chunk_limit(mut self, limit: usize) -> Self {
        self.default_chunk_limit = limit.max(1);
        self
    }

    /// Nests every interpreter span this compile produces under `span`.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

pub(crate) type PinnedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_join_runs_to_completion() {
        let rt = TokioRuntime::current();
        let done = Arc::new(parking_lot::Mutex::new(false));
        let done2 = done.clone();
        let fiber = rt.spawn(Box::pin(async move {
            *done2.lock() = true;
        }));
        let exit = fiber.join().await;
        assert!(exit.is_success());
        assert!(*done.lock());
    }

    #[tokio::test]
    async fn cancel_reports_canceled() {
        let rt = TokioRuntime::current();
        let fiber = rt.spawn(Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        fiber.cancel();
        let exit = fiber.join().await;
        assert!(matches!(exit, ExitCase::Canceled));
    }
}
