//! The scope tree (§3, §4.2): bracketed finalization, leases, interruption.
//!
//! An `Arc`-backed, clone-cheap handle guards a shared node behind a lock; each
//! finalizer entry is an erased destructor closure run at scope close. This scope tree
//! holds only finalizers and child scopes, not arbitrary per-callsite component state.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::deferred::Deferred;
use crate::error::{ExitCase, StreamError, StreamResult};
use crate::runtime::Runtime;
use crate::token::Token;

type Finalizer = Box<dyn FnOnce(ExitCase) -> BoxFuture<'static, StreamResult<()>> + Send>;

enum State {
    Open,
    Closing,
    Closed(Option<StreamError>),
}

#[derive(Clone)]
struct InterruptSignal {
    scope_id: Token,
    err: Option<StreamError>,
}

struct InterruptCtx {
    deferred: Deferred<InterruptSignal>,
}

struct Inner {
    children: Vec<Scope>,
    finalizers: Vec<(Token, Finalizer)>,
    state: State,
    leases: usize,
}

struct ScopeData {
    id: Token,
    parent: Option<Scope>,
    interrupt_ctx: Option<InterruptCtx>,
    inner: Mutex<Inner>,
    lease_idle: Notify,
    runtime: Arc<dyn Runtime>,
}

/// A node in the scope tree. Cheap to clone (an `Arc` bump); equality is by identity.
#[derive(Clone)]
pub struct Scope(Arc<ScopeData>);

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Scope {}

/// What an `interruptibleEval` raced against the nearest interruptible ancestor's signal
/// resolved to.
pub enum EvalOutcome<T> {
    Done(StreamResult<T>),
    Interrupted(Token, Option<StreamError>),
}

/// A held lease on a scope: while any lease is outstanding, `close` waits for it to be
/// dropped before running finalizers (§4.2 `lease`).
pub struct Lease {
    scope: Scope,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let idle = {
            let mut inner = self.scope.0.inner.lock();
            inner.leases -= 1;
            inner.leases == 0
        };
        if idle {
            self.scope.0.lease_idle.notify_waiters();
        }
    }
}

impl Scope {
    /// Builds a fresh, parentless root scope running against `runtime`.
    pub fn root(runtime: Arc<dyn Runtime>) -> Scope {
        Scope(Arc::new(ScopeData {
            id: Token::new(),
            parent: None,
            interrupt_ctx: None,
            inner: Mutex::new(Inner {
                children: Vec::new(),
                finalizers: Vec::new(),
                state: State::Open,
                leases: 0,
            }),
            lease_idle: Notify::new(),
            runtime,
        }))
    }

    pub fn id(&self) -> Token {
        self.0.id
    }

    /// The effect capability this scope's subtree spawns fibers against. Changed for a
    /// sub-stream only by `translate`, which opens a dedicated child scope carrying the
    /// new runtime (§5.1).
    pub fn runtime(&self) -> Arc<dyn Runtime> {
        self.0.runtime.clone()
    }

    fn is_open(&self) -> bool {
        matches!(self.0.inner.lock().state, State::Open)
    }

    /// Opens a new child scope of `self`, inheriting its runtime. Fails if `self` is
    /// Closing or Closed (§4.2).
    pub fn open_child(&self, interruptible: bool) -> StreamResult<Scope> {
        self.open_child_with_runtime(interruptible, self.0.runtime.clone())
    }

    /// Opens a new child scope of `self` running against `runtime` instead of
    /// inheriting `self`'s. The mechanism behind `translate` (§4.4, §5.1): the
    /// translated sub-stream runs entirely within this child, so finalizers it
    /// registers and scopes it opens all see the new runtime too.
    pub fn open_child_with_runtime(
        &self,
        interruptible: bool,
        runtime: Arc<dyn Runtime>,
    ) -> StreamResult<Scope> {
        let mut inner = self.0.inner.lock();
        if !matches!(inner.state, State::Open) {
            return Err(StreamError::msg("openChild on a scope that is not Open"));
        }
        let child = Scope(Arc::new(ScopeData {
            id: Token::new(),
            parent: Some(self.clone()),
            interrupt_ctx: if interruptible {
                Some(InterruptCtx { deferred: Deferred::new() })
            } else {
                None
            },
            inner: Mutex::new(Inner {
                children: Vec::new(),
                finalizers: Vec::new(),
                state: State::Open,
                leases: 0,
            }),
            lease_idle: Notify::new(),
            runtime,
        }));
        inner.children.push(child.clone());
        trace!(child = ?child.0.id, parent = ?self.0.id, interruptible, "opened child scope");
        Ok(child)
    }

    /// Registers a finalizer, run exactly once with this scope's eventual `ExitCase`.
    /// Fails if the scope is not Open (§4.2).
    pub fn register_finalizer<F, Fut>(&self, release: F) -> StreamResult<Token>
    where
        F: FnOnce(ExitCase) -> Fut + Send + 'static,
        Fut: Future<Output = StreamResult<()>> + Send + 'static,
    {
        let mut inner = self.0.inner.lock();
        if !matches!(inner.state, State::Open) {
            return Err(StreamError::msg("registerFinalizer on a scope that is not Open"));
        }
        let token = Token::new();
        let boxed: Finalizer = Box::new(move |ec| Box::pin(release(ec)));
        inner.finalizers.push((token, boxed));
        Ok(token)
    }

    /// Runs a single finalizer early and removes it from the list, used by `bracketCase`
    /// to release as soon as the emitted value's downstream use is done rather than
    /// waiting for the whole scope to close.
    pub async fn release_resource(&self, token: Token, exit: ExitCase) -> StreamResult<()> {
        let finalizer = {
            let mut inner = self.0.inner.lock();
            let pos = inner.finalizers.iter().position(|(t, _)| *t == token);
            pos.map(|i| inner.finalizers.remove(i).1)
        };
        match finalizer {
            Some(f) => f(exit).await,
            None => Ok(()),
        }
    }

    async fn wait_for_leases(&self) {
        loop {
            let idle = self.0.lease_idle.notified();
            if self.0.inner.lock().leases == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Closes this scope: transitions Open -> Closing -> Closed, recursing into
    /// still-open children LIFO before running this scope's own finalizers LIFO (I1,
    /// I2). Idempotent past the first call (I3). All errors observed are collected into
    /// a single composite.
    pub fn close(&self, exit: ExitCase) -> BoxFuture<'static, StreamResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            {
                let mut inner = this.0.inner.lock();
                match inner.state {
                    State::Closed(_) | State::Closing => return Ok(()),
                    State::Open => inner.state = State::Closing,
                }
            }

            let children = { this.0.inner.lock().children.clone() };
            let mut errors = Vec::new();
            for child in children.iter().rev() {
                if let Err(e) = child.close(exit.clone()).await {
                    errors.push(e);
                }
            }

            this.wait_for_leases().await;

            let finalizers = {
                let mut inner = this.0.inner.lock();
                std::mem::take(&mut inner.finalizers)
            };
            for (_, finalizer) in finalizers.into_iter().rev() {
                if let Err(e) = finalizer(exit.clone()).await {
                    errors.push(e);
                }
            }

            let combined = if errors.is_empty() {
                None
            } else {
                let mut iter = errors.into_iter();
                let primary = iter.next().unwrap();
                Some(primary.combine(iter.collect()))
            };

            this.0.inner.lock().state = State::Closed(combined.clone());
            debug!(scope = ?this.0.id, failed = combined.is_some(), "closed scope");
            match combined {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Acquires a lease: `Some` only while Open. Holding the returned [`Lease`] defers
    /// this scope's finalizers until it is dropped (I4).
    pub fn lease(&self) -> Option<Lease> {
        let mut inner = self.0.inner.lock();
        if matches!(inner.state, State::Open) {
            inner.leases += 1;
            Some(Lease { scope: self.clone() })
        } else {
            None
        }
    }

    /// Searches `self` and its ancestors for a scope with id `token`.
    pub fn find_self_or_ancestor(&self, token: Token) -> Option<Scope> {
        let mut cur = self.clone();
        loop {
            if cur.0.id == token {
                return Some(cur);
            }
            match &cur.0.parent {
                Some(p) => cur = p.clone(),
                None => return None,
            }
        }
    }

    /// Searches `self` and its open descendants for a scope with id `token`.
    pub fn find_self_or_child(&self, token: Token) -> Option<Scope> {
        if self.0.id == token {
            return Some(self.clone());
        }
        let children = self.0.inner.lock().children.clone();
        for child in &children {
            if let Some(found) = child.find_self_or_child(token) {
                return Some(found);
            }
        }
        None
    }

    /// Resolves the scope a `Step` targeting `token` should run `inner` in: an ancestor
    /// of `self` reachable by walking up, or (failing that) a descendant reachable by
    /// walking down, mirroring the interpreter's "current scope if None, else lookup"
    /// routing (§4.3). `None` is a fatal protocol error at the call site — a dangling
    /// scope reference produced by an unsafe cross-fiber `uncons`.
    pub fn find_step_scope(&self, token: Token) -> Option<Scope> {
        self.find_self_or_ancestor(token).or_else(|| self.find_self_or_child(token))
    }

    fn nearest_interruptible(&self) -> Option<Scope> {
        let mut cur = self.clone();
        loop {
            if cur.0.interrupt_ctx.is_some() {
                return Some(cur);
            }
            match &cur.0.parent {
                Some(p) => cur = p.clone(),
                None => return None,
            }
        }
    }

    pub fn is_interruptible(&self) -> bool {
        self.0.interrupt_ctx.is_some()
    }

    /// Non-blocking check: has the nearest interruptible ancestor already fired? Used by
    /// `Output` to refuse emitting a chunk that raced an interrupt which landed before the
    /// chunk was even ready (§4.3).
    pub fn interrupted_now(&self) -> Option<(Token, Option<StreamError>)> {
        let ctx_scope = self.nearest_interruptible()?;
        let signal = ctx_scope.0.interrupt_ctx.as_ref().unwrap().deferred.try_get()?;
        Some((signal.scope_id, signal.err))
    }

    /// Fires this scope's interrupt signal. A no-op on a non-interruptible scope.
    pub async fn interrupt(&self, err: Option<StreamError>) {
        if let Some(ctx) = &self.0.interrupt_ctx {
            let _ = ctx.deferred.complete(InterruptSignal { scope_id: self.0.id, err });
        }
    }

    /// Runs `fut` to completion unless the nearest enclosing interruptible scope fires
    /// first, in which case `fut` is left running to completion in the background (not
    /// all effects are cancellable) and its eventual result discarded (§4.2).
    pub async fn interruptible_eval<T>(
        &self,
        fut: impl Future<Output = StreamResult<T>> + Send + 'static,
    ) -> EvalOutcome<T>
    where
        T: Send + 'static,
    {
        match self.nearest_interruptible() {
            None => EvalOutcome::Done(fut.await),
            Some(ctx_scope) => {
                let deferred = ctx_scope.0.interrupt_ctx.as_ref().unwrap().deferred.clone();
                tokio::select! {
                    res = fut => EvalOutcome::Done(res),
                    sig = deferred.get() => EvalOutcome::Interrupted(sig.scope_id, sig.err),
                }
            }
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("id", &self.0.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn finalizer(counter: Arc<AtomicUsize>, expect_order: usize) -> impl FnOnce(ExitCase) -> BoxFuture<'static, StreamResult<()>> {
        move |_ec| {
            Box::pin(async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, expect_order);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn finalizers_run_lifo() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        let counter = Arc::new(AtomicUsize::new(0));
        root.register_finalizer(finalizer(counter.clone(), 2)).unwrap();
        root.register_finalizer(finalizer(counter.clone(), 1)).unwrap();
        root.register_finalizer(finalizer(counter.clone(), 0)).unwrap();
        root.close(ExitCase::Succeeded).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn children_close_before_parent_finalizers() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        let counter = Arc::new(AtomicUsize::new(0));
        let child = root.open_child(false).unwrap();
        child.register_finalizer(finalizer(counter.clone(), 0)).unwrap();
        root.register_finalizer(finalizer(counter.clone(), 1)).unwrap();
        root.close(ExitCase::Succeeded).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        let counter = Arc::new(AtomicUsize::new(0));
        root.register_finalizer(finalizer(counter.clone(), 0)).unwrap();
        root.close(ExitCase::Succeeded).await.unwrap();
        root.close(ExitCase::Succeeded).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn register_finalizer_fails_once_closing() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        root.close(ExitCase::Succeeded).await.unwrap();
        assert!(root.register_finalizer(|_| Box::pin(async { Ok(()) })).is_err());
    }

    #[tokio::test]
    async fn lease_defers_finalizers_until_dropped() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        let counter = Arc::new(AtomicUsize::new(0));
        root.register_finalizer(finalizer(counter.clone(), 0)).unwrap();
        let lease = root.lease().unwrap();
        let root2 = root.clone();
        let closer = tokio::spawn(async move { root2.close(ExitCase::Succeeded).await });
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(lease);
        closer.await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupt_resolves_interruptible_eval() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        let child = root.open_child(true).unwrap();
        let child2 = child.clone();
        let evaluator = tokio::spawn(async move {
            child2
                .interruptible_eval(async {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        child.interrupt(None).await;
        match evaluator.await.unwrap() {
            EvalOutcome::Interrupted(id, None) => assert_eq!(id, child.id()),
            _ => panic!("expected interruption"),
        }
    }

    #[tokio::test]
    async fn find_helpers_locate_ancestors_and_descendants() {
        let root = Scope::root(std::sync::Arc::new(crate::runtime::TokioRuntime::current()));
        let child = root.open_child(false).unwrap();
        let grandchild = child.open_child(false).unwrap();
        assert!(grandchild.find_self_or_ancestor(root.id()).is_some());
        assert!(root.find_self_or_child(grandchild.id()).is_some());
        assert!(root.find_self_or_ancestor(grandchild.id()).is_none());
    }
}
