//! The Pull interpreter's instruction interface and leaf nodes (§3, §4.3).
//!
//! The source's `Pull<F,O,R>` is a free algebra with a result type `R` that varies per
//! operation (`uncons` needs a tuple, most combinators need `Unit`). Rust has no
//! HKT/GADTs to express that generically as one enum, so this crate collapses the
//! composition surface to a single object-safe `PullTrait<O>` (`step` is its only
//! method), the same move the `futures` crate makes for `Stream` combinators — each
//! combinator is its own small struct implementing the trait, type-erased only at
//! `BoxPull<O>` boundaries. `uncons`/`stepLeg` (whose result genuinely isn't a `Stream`)
//! become privileged functions that call `.step()` directly instead of being assembled
//! from generic `Bind` terms. See DESIGN.md, Open Question decision 4.

use futures::future::BoxFuture;

use crate::chunk::Chunk;
use crate::error::{ExitCase, StreamError, StreamResult};
use crate::scope::{EvalOutcome, Scope};
use crate::token::Token;

/// One interpreter step's result (§4.3 `StepResult`).
pub enum StepOutcome<O> {
    /// The program is finished; no more chunks will be produced.
    Done(Scope),
    /// A chunk was produced; `tail` continues the program from here in `scope`.
    Output(Chunk<O>, Scope, BoxPull<O>),
    /// An interrupt-capable ancestor fired before the next chunk was produced.
    Interrupted(Token, Option<StreamError>),
}

/// A node in the Pull program. `step` consumes `self` (by `Box`) because most nodes are
/// one-shot: once stepped, whatever remains is returned as a fresh `tail` rather than
/// `self` being steppable twice.
pub trait PullTrait<O>: Send {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>>
    where
        O: 'static;
}

/// A boxed, type-erased Pull program producing `O`.
pub type BoxPull<O> = Box<dyn PullTrait<O>>;

/// The empty program: immediately `Done`.
pub struct DoneNode;

impl<O: Send + 'static> PullTrait<O> for DoneNode {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move { Ok(StepOutcome::Done(scope)) })
    }
}

/// Emits a single chunk, then finishes.
pub struct EmitNode<O> {
    chunk: Chunk<O>,
}

impl<O> EmitNode<O> {
    pub fn new(chunk: Chunk<O>) -> Self {
        EmitNode { chunk }
    }
}

impl<O: Send + 'static> PullTrait<O> for EmitNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            // Emitting carries no suspension point to race against, but an already-fired
            // interrupt on an ancestor scope still must be observed before more output
            // escapes rather than silently emitting once more (§4.3 `Output`).
            if let Some((tok, err)) = scope.interrupted_now() {
                return Ok(StepOutcome::Interrupted(tok, err));
            }
            Ok(StepOutcome::Output(self.chunk, scope, Box::new(DoneNode)))
        })
    }
}

/// Immediately fails with `err`. Consumed by the first read.
pub struct RaiseErrorNode<O> {
    err: Option<StreamError>,
    _marker: std::marker::PhantomData<O>,
}

impl<O> RaiseErrorNode<O> {
    pub fn new(err: StreamError) -> Self {
        RaiseErrorNode { err: Some(err), _marker: std::marker::PhantomData }
    }
}

impl<O: Send + 'static> PullTrait<O> for RaiseErrorNode<O> {
    fn step(mut self: Box<Self>, _scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move { Err(self.err.take().expect("RaiseErrorNode stepped twice")) })
    }
}

/// Runs an effect, racing it against the nearest interruptible ancestor, and emits its
/// result as a single-element chunk (the Rust realization of `Eval(fx)` followed
/// immediately by a `flatMap` continuation — see module docs).
pub struct EvalNode<O> {
    fut: BoxFuture<'static, StreamResult<O>>,
}

impl<O> EvalNode<O> {
    pub fn new(fut: BoxFuture<'static, StreamResult<O>>) -> Self {
        EvalNode { fut }
    }
}

impl<O: Send + 'static> PullTrait<O> for EvalNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match scope.interruptible_eval(self.fut).await {
                EvalOutcome::Done(Ok(value)) => {
                    Ok(StepOutcome::Output(Chunk::single(value), scope, Box::new(DoneNode)))
                }
                EvalOutcome::Done(Err(e)) => Err(e),
                EvalOutcome::Interrupted(tok, err) => Ok(StepOutcome::Interrupted(tok, err)),
            }
        })
    }
}

/// Runs an effect purely for its side effect; nothing is emitted (the Rust realization
/// of `exec`).
pub struct ExecNode {
    fut: BoxFuture<'static, StreamResult<()>>,
}

impl ExecNode {
    pub fn new(fut: BoxFuture<'static, StreamResult<()>>) -> Self {
        ExecNode { fut }
    }
}

impl<O: Send + 'static> PullTrait<O> for ExecNode {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match scope.interruptible_eval(self.fut).await {
                EvalOutcome::Done(Ok(())) => Ok(StepOutcome::Done(scope)),
                EvalOutcome::Done(Err(e)) => Err(e),
                EvalOutcome::Interrupted(tok, err) => Ok(StepOutcome::Interrupted(tok, err)),
            }
        })
    }
}

/// `Acquire` (§3, §4.2): runs `acquire`, and only once it succeeds registers `release`
/// as a finalizer of `scope`, then emits the resource. Resources are shared as `Arc<R>`
/// so both the emitted value and the registered finalizer closure can reach it (Rust has
/// no GC-shared-value equivalent of the source's bracket here) — see DESIGN.md.
pub struct BracketNode<R> {
    acquire: BoxFuture<'static, StreamResult<R>>,
    release: Box<dyn FnOnce(std::sync::Arc<R>, ExitCase) -> BoxFuture<'static, StreamResult<()>> + Send>,
}

impl<R: Send + Sync + 'static> BracketNode<R> {
    pub fn new<A, Rel, RelFut>(acquire: A, release: Rel) -> Self
    where
        A: std::future::Future<Output = StreamResult<R>> + Send + 'static,
        Rel: FnOnce(std::sync::Arc<R>, ExitCase) -> RelFut + Send + 'static,
        RelFut: std::future::Future<Output = StreamResult<()>> + Send + 'static,
    {
        BracketNode {
            acquire: Box::pin(acquire),
            release: Box::new(move |r, ec| Box::pin(release(r, ec))),
        }
    }
}

impl<R: Send + Sync + 'static> PullTrait<std::sync::Arc<R>> for BracketNode<R> {
    fn step(
        self: Box<Self>,
        scope: Scope,
    ) -> BoxFuture<'static, StreamResult<StepOutcome<std::sync::Arc<R>>>> {
        Box::pin(async move {
            match scope.interruptible_eval(self.acquire).await {
                EvalOutcome::Interrupted(tok, err) => return Ok(StepOutcome::Interrupted(tok, err)),
                EvalOutcome::Done(Err(e)) => return Err(e),
                EvalOutcome::Done(Ok(resource)) => {
                    let resource = std::sync::Arc::new(resource);
                    let release = self.release;
                    let for_release = resource.clone();
                    scope.register_finalizer(move |ec| release(for_release, ec))?;
                    Ok(StepOutcome::Output(Chunk::single(resource), scope, Box::new(DoneNode)))
                }
            }
        })
    }
}

/// Returns the current scope as a single "value", used by combinators that need to
/// inspect it (e.g. `interruptScope`'s setup) without emitting anything to the user.
pub struct GetScopeNode<O> {
    _marker: std::marker::PhantomData<O>,
}

impl<O> GetScopeNode<O> {
    pub fn new() -> Self {
        GetScopeNode { _marker: std::marker::PhantomData }
    }
}

impl<O: Send + 'static> PullTrait<O> for GetScopeNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move { Ok(StepOutcome::Done(scope)) })
    }
}

/// The privileged `uncons` entry point (§4.4): steps `pull` once in `scope`, discarding
/// the intermediate scope id per spec, and reports interruption as its own case rather
/// than folding it into `None`.
pub enum UnconsOutcome<O> {
    Some(Chunk<O>, BoxPull<O>),
    None,
    Interrupted(Token, Option<StreamError>),
}

pub async fn uncons<O: Send + 'static>(pull: BoxPull<O>, scope: Scope) -> StreamResult<UnconsOutcome<O>> {
    match pull.step(scope).await? {
        StepOutcome::Done(_) => Ok(UnconsOutcome::None),
        StepOutcome::Output(chunk, _scope, tail) => Ok(UnconsOutcome::Some(chunk, tail)),
        StepOutcome::Interrupted(tok, err) => Ok(UnconsOutcome::Interrupted(tok, err)),
    }
}

/// A `(head, scope, tail)` triple produced by [`step_leg`]; resuming a leg runs its tail
/// in the scope it was stepped from, rather than the caller's current scope, so
/// cross-fiber pulls (`parJoin`'s per-inner-stream fibers) stay correctly scoped (§4.4
/// `stepLeg`).
pub struct StepLeg<O> {
    pub head: Chunk<O>,
    pub scope: Scope,
    tail: BoxPull<O>,
}

impl<O: Send + 'static> StepLeg<O> {
    /// Steps the tail again, continuing in this leg's own scope rather than whatever
    /// scope is ambient at the call site.
    pub async fn next(self) -> StreamResult<Option<StepLeg<O>>> {
        match self.tail.step(self.scope).await? {
            StepOutcome::Done(_) => Ok(None),
            StepOutcome::Output(chunk, scope, tail) => Ok(Some(StepLeg { head: chunk, scope, tail })),
            // A bare interruption is a successful termination (§7), not a failure: only an
            // interruption carrying its own error is reported up.
            StepOutcome::Interrupted(_tok, None) => Ok(None),
            StepOutcome::Interrupted(_tok, Some(err)) => Err(err),
        }
    }
}

pub async fn step_leg<O: Send + 'static>(
    pull: BoxPull<O>,
    scope: Scope,
) -> StreamResult<Option<StepLeg<O>>> {
    match pull.step(scope).await? {
        StepOutcome::Done(_) => Ok(None),
        StepOutcome::Output(chunk, scope, tail) => Ok(Some(StepLeg { head: chunk, scope, tail })),
        StepOutcome::Interrupted(_tok, None) => Ok(None),
        StepOutcome::Interrupted(_tok, Some(err)) => Err(err),
    }
}
