//! Stream constructors (§6). Direct one-liners over [`crate::pull`]'s leaf nodes: small
//! pure builder functions each returning a freshly composed `Stream`.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::chunk::Chunk;
use crate::error::{ExitCase, StreamError, StreamResult};
use crate::pull::{BracketNode, DoneNode, EmitNode, EvalNode, ExecNode, RaiseErrorNode};
use crate::Stream;

/// The empty stream: no elements, ends immediately with `Pure`.
pub fn empty<O: Send + 'static>() -> Stream<O> {
    Stream::from_pull(Box::new(DoneNode))
}

/// A single-element stream.
pub fn emit<O: Send + 'static>(value: O) -> Stream<O> {
    Stream::from_pull(Box::new(EmitNode::new(Chunk::single(value))))
}

/// A stream of every element in `values`, delivered as one chunk.
pub fn emits<O, I>(values: I) -> Stream<O>
where
    O: Send + 'static,
    I: IntoIterator<Item = O>,
{
    Stream::from_pull(Box::new(EmitNode::new(Chunk::from_iter(values))))
}

/// A stream that emits exactly `c`.
pub fn chunk<O: Send + 'static>(c: Chunk<O>) -> Stream<O> {
    Stream::from_pull(Box::new(EmitNode::new(c)))
}

/// Runs `fut`, emitting its single result.
pub fn eval<O, Fut>(fut: Fut) -> Stream<O>
where
    O: Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    Stream::from_pull(Box::new(EvalNode::new(Box::pin(fut))))
}

/// Runs `fut` to get a whole chunk to emit at once, rather than wrapping a single result
/// element the way plain `eval` does.
pub fn eval_unchunk<O, Fut>(fut: Fut) -> Stream<O>
where
    O: Send + 'static,
    Fut: std::future::Future<Output = StreamResult<Chunk<O>>> + Send + 'static,
{
    use crate::pull::{PullTrait, StepOutcome};
    use crate::scope::{EvalOutcome, Scope};

    struct EvalChunkNode<O> {
        fut: BoxFuture<'static, StreamResult<Chunk<O>>>,
    }

    impl<O: Send + 'static> PullTrait<O> for EvalChunkNode<O> {
        fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
            Box::pin(async move {
                match scope.interruptible_eval(self.fut).await {
                    EvalOutcome::Done(Ok(c)) => Ok(StepOutcome::Output(c, scope, Box::new(DoneNode))),
                    EvalOutcome::Done(Err(e)) => Err(e),
                    EvalOutcome::Interrupted(tok, err) => Ok(StepOutcome::Interrupted(tok, err)),
                }
            })
        }
    }

    Stream::from_pull(Box::new(EvalChunkNode { fut: Box::pin(fut) }))
}

/// Runs `fut` purely for its side effect; the resulting stream emits nothing.
pub fn exec<Fut>(fut: Fut) -> Stream<std::convert::Infallible>
where
    Fut: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    Stream::from_pull(Box::new(ExecNode::new(Box::pin(fut))))
}

/// Fails immediately with `err`.
pub fn raise_error<O: Send + 'static>(err: StreamError) -> Stream<O> {
    Stream::from_pull(Box::new(RaiseErrorNode::new(err)))
}

/// Acquires `R` via `acquire`, registers `release` to run at scope close (or earlier, if
/// released explicitly downstream), and emits the resource as `Arc<R>` (§4.2
/// `bracketCase`).
pub fn bracket_case<R, A, Rel, RelFut>(acquire: A, release: Rel) -> Stream<Arc<R>>
where
    R: Send + Sync + 'static,
    A: std::future::Future<Output = StreamResult<R>> + Send + 'static,
    Rel: FnOnce(Arc<R>, ExitCase) -> RelFut + Send + 'static,
    RelFut: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    Stream::from_pull(Box::new(BracketNode::new(acquire, release)))
}

/// `bracketCase` with a release that ignores the exit case — the common case.
pub fn bracket<R, A, Rel, RelFut>(acquire: A, release: Rel) -> Stream<Arc<R>>
where
    R: Send + Sync + 'static,
    A: std::future::Future<Output = StreamResult<R>> + Send + 'static,
    Rel: FnOnce(Arc<R>) -> RelFut + Send + 'static,
    RelFut: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    bracket_case(acquire, move |r, _exit| release(r))
}

/// `bracket`, specialised so the resource itself already knows how to release itself
/// (anything implementing [`Resource`]).
pub fn resource<R>(acquire: impl std::future::Future<Output = StreamResult<R>> + Send + 'static) -> Stream<Arc<R>>
where
    R: Resource + Send + Sync + 'static,
{
    bracket(acquire, |r| async move { r.release().await })
}

/// A type that knows how to tear itself down, for use with [`resource`].
#[async_trait::async_trait]
pub trait Resource {
    async fn release(&self) -> StreamResult<()>;
}

/// An infinite stream repeating `value`.
pub fn constant<O: Clone + Send + 'static>(value: O) -> Stream<O> {
    unfold((), move |_| {
        let value = value.clone();
        Some((value, ()))
    })
}

/// `start..end` (exclusive), stepping by `step` (which may be negative via
/// [`range_by`]).
pub fn range(start: i64, end: i64) -> Stream<i64> {
    range_by(start, end, 1)
}

/// `range`, with an explicit (possibly negative, never zero) step.
pub fn range_by(start: i64, end: i64, step: i64) -> Stream<i64> {
    assert_ne!(step, 0, "range step must not be zero");
    unfold(start, move |cur| {
        let keep_going = if step > 0 { cur < end } else { cur > end };
        if keep_going {
            Some((cur, cur + step))
        } else {
            None
        }
    })
}

/// `seed, f(seed), f(f(seed)), ...` forever.
pub fn iterate<O, F>(seed: O, mut f: F) -> Stream<O>
where
    O: Clone + Send + 'static,
    F: FnMut(&O) -> O + Send + 'static,
{
    unfold(seed, move |cur| {
        let next = f(&cur);
        Some((cur, next))
    })
}

/// Like `iterate`, but each step is effectful.
pub fn iterate_eval<O, F, Fut>(seed: O, f: F) -> Stream<O>
where
    O: Clone + Send + 'static,
    F: FnMut(O) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    unfold_eval(seed, f_to_pair(f))
}

fn f_to_pair<O, F, Fut>(mut f: F) -> impl FnMut(O) -> BoxFuture<'static, StreamResult<Option<(O, O)>>> + Send + 'static
where
    O: Clone + Send + 'static,
    F: FnMut(O) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    move |cur: O| {
        let fut = f(cur.clone());
        Box::pin(async move { fut.await.map(|next| Some((cur, next))) })
    }
}

/// Generates elements from a pure state machine: `f` returns the next element plus the
/// carried-forward state, or `None` to end the stream.
pub fn unfold<S, O, F>(seed: S, mut f: F) -> Stream<O>
where
    S: Send + 'static,
    O: Send + 'static,
    F: FnMut(S) -> Option<(O, S)> + Send + 'static,
{
    use crate::pull::{PullTrait, StepOutcome};
    use crate::scope::Scope;

    struct UnfoldNode<S, O, F> {
        state: S,
        f: F,
        _marker: std::marker::PhantomData<O>,
    }

    impl<S, O, F> PullTrait<O> for UnfoldNode<S, O, F>
    where
        S: Send + 'static,
        O: Send + 'static,
        F: FnMut(S) -> Option<(O, S)> + Send + 'static,
    {
        fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
            Box::pin(async move {
                match (self.f)(self.state) {
                    None => Ok(StepOutcome::Done(scope)),
                    Some((value, next_state)) => {
                        self.state = next_state;
                        Ok(StepOutcome::Output(Chunk::single(value), scope, self))
                    }
                }
            })
        }
    }

    Stream::from_pull(Box::new(UnfoldNode { state: seed, f, _marker: std::marker::PhantomData }))
}

/// `unfold`, with an effectful step function.
pub fn unfold_eval<S, O, F, Fut>(seed: S, mut f: F) -> Stream<O>
where
    S: Send + 'static,
    O: Send + 'static,
    F: FnMut(S) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<Option<(O, S)>>> + Send + 'static,
{
    use crate::pull::{PullTrait, StepOutcome};
    use crate::scope::{EvalOutcome, Scope};

    struct UnfoldEvalNode<S, O, F> {
        state: S,
        f: F,
        _marker: std::marker::PhantomData<O>,
    }

    impl<S, O, F, Fut> PullTrait<O> for UnfoldEvalNode<S, O, F>
    where
        S: Send + 'static,
        O: Send + 'static,
        F: FnMut(S) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = StreamResult<Option<(O, S)>>> + Send + 'static,
    {
        fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
            Box::pin(async move {
                let fut = (self.f)(self.state);
                match scope.interruptible_eval(fut).await {
                    EvalOutcome::Done(Ok(None)) => Ok(StepOutcome::Done(scope)),
                    EvalOutcome::Done(Ok(Some((value, next_state)))) => {
                        self.state = next_state;
                        Ok(StepOutcome::Output(Chunk::single(value), scope, self))
                    }
                    EvalOutcome::Done(Err(e)) => Err(e),
                    EvalOutcome::Interrupted(tok, err) => Ok(StepOutcome::Interrupted(tok, err)),
                }
            })
        }
    }

    Stream::from_pull(Box::new(UnfoldEvalNode { state: seed, f, _marker: std::marker::PhantomData }))
}

/// Runs `fut` forever, emitting each result.
pub fn repeat_eval<O, F, Fut>(mut f: F) -> Stream<O>
where
    O: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    unfold_eval((), move |()| {
        let fut = f();
        async move { fut.await.map(|v| Some((v, ()))) }
    })
}

/// Every element of an (owned) iterator, as a single chunk.
pub fn from_iterator<O, I>(iter: I) -> Stream<O>
where
    O: Send + 'static,
    I: IntoIterator<Item = O>,
{
    emits(iter)
}
