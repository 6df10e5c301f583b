//! `Stream<O>` and its combinators (§4.4, §4.6): the user-facing algebra built on top of
//! [`crate::pull`]. Each combinator below is a small struct wrapping an upstream
//! [`BoxPull`] plus whatever continuation/closure it needs, stepped one chunk at a time.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::trace;

use crate::chunk::Chunk;
use crate::error::{ExitCase, StreamError, StreamResult};
use crate::pull::{self, BoxPull, DoneNode, PullTrait, StepOutcome};
use crate::queue::BoundedQueue;
use crate::runtime::Runtime;
use crate::scope::Scope;

/// A `Stream<O>` is a newtype over a Pull program that only ever emits `O` (§3). Every
/// combinator below consumes `self` and returns a new `Stream`, so composition reads
/// left-to-right the way it would against any other `Stream` implementation in the
/// ecosystem.
pub struct Stream<O>(pub(crate) BoxPull<O>);

impl<O: Send + 'static> Stream<O> {
    pub(crate) fn from_pull(pull: BoxPull<O>) -> Self {
        Stream(pull)
    }

    pub(crate) fn into_pull(self) -> BoxPull<O> {
        self.0
    }

    /// `s1 ++ s2`: `s2` runs iff `s1` ends with `Pure` (P2).
    pub fn append(self, other: Stream<O>) -> Stream<O>
    where
        O: 'static,
    {
        Stream(Box::new(AppendNode { first: self.0, second: other.0 }))
    }

    /// Pushes `f` through each emitted chunk without an effectful frame.
    pub fn map<O2, F>(self, f: F) -> Stream<O2>
    where
        O2: Send + 'static,
        F: FnMut(&O) -> O2 + Send + 'static,
    {
        Stream(Box::new(MapNode { inner: self.0, f }))
    }

    /// Repeatedly `uncons`s one chunk, running `f` on each element in turn and emitting
    /// the per-element streams in order (§4.4).
    pub fn flat_map<O2, F>(self, f: F) -> Stream<O2>
    where
        O: Clone,
        O2: Send + 'static,
        F: FnMut(O) -> Stream<O2> + Send + 'static,
    {
        Stream(Box::new(FlatMapNode {
            inner: self.0,
            f,
            current: None,
            pending: std::collections::VecDeque::new(),
        }))
    }

    /// On `Fail(e)`, continues with `h(e)` instead (§4.4). A handled error is consumed.
    pub fn handle_error_with<F>(self, h: F) -> Stream<O>
    where
        F: FnOnce(StreamError) -> Stream<O> + Send + 'static,
    {
        Stream(Box::new(HandleErrorWithNode { inner: Some(self.0), handler: Some(h) }))
    }

    /// Materializes errors as elements instead of failing (§7).
    pub fn attempt(self) -> Stream<Result<O, StreamError>>
    where
        O: Clone,
    {
        Stream(Box::new(AttemptNode { inner: Some(self.0) }))
    }

    /// Wraps `self` in a plain (non-interruptible) child of whatever scope is ambient
    /// when this node is first stepped. The child is opened lazily rather than eagerly
    /// against a caller-supplied `Scope`, since a `Stream<O>` value is built and composed
    /// long before any scope exists — only `compile.rs` has one of those.
    pub fn scope(self) -> Stream<O> {
        Stream(Box::new(ScopedNode::new(self.0, false)))
    }

    /// Wraps `self` in an interruptible child scope (§4.4, used by `interrupt_when`).
    pub fn interrupt_scope(self) -> Stream<O> {
        Stream(Box::new(ScopedNode::new(self.0, true)))
    }

    /// Moves the remainder of `self` onto `runtime`: everything downstream that spawns
    /// fibers (an `interruptWhen` watcher, `parJoin` workers, `prefetch`'s look-ahead)
    /// does so against `runtime` from here on (§5.1). Fails synchronously if the
    /// current scope is interruptible and `runtime` cannot host that (translate across
    /// an interruptible scope requires the same capability on both sides).
    pub fn translate(self, runtime: Arc<dyn Runtime>) -> Stream<O> {
        Stream(Box::new(TranslateNode { inner: Some(self.0), runtime }))
    }

    /// First `n` elements (or fewer). Ends with `Pure`, not an error, the instant the
    /// count is exhausted, so finalizers still run normally (P5, P7).
    pub fn take(self, n: usize) -> Stream<O>
    where
        O: Clone,
    {
        Stream(Box::new(TakeNode { inner: self.0, remaining: n }))
    }

    /// Elements while `p` holds. `include_failure` controls whether the first
    /// non-matching element is still emitted before stopping.
    pub fn take_while<F>(self, predicate: F, include_failure: bool) -> Stream<O>
    where
        O: Clone,
        F: FnMut(&O) -> bool + Send + 'static,
    {
        Stream(Box::new(TakeWhileNode { inner: Some(self.0), predicate, include_failure }))
    }

    /// All but the first `n` elements.
    pub fn drop(self, n: usize) -> Stream<O>
    where
        O: Clone,
    {
        Stream(Box::new(DropNode { inner: self.0, remaining: n }))
    }

    /// Elements from the first one for which `p` is false, onward.
    pub fn drop_while<F>(self, predicate: F) -> Stream<O>
    where
        O: Clone,
        F: FnMut(&O) -> bool + Send + 'static,
    {
        Stream(Box::new(DropWhileNode { inner: Some(self.0), predicate, dropping: true }))
    }

    /// Keeps elements matching `p`.
    pub fn filter<F>(self, predicate: F) -> Stream<O>
    where
        O: Clone,
        F: FnMut(&O) -> bool + Send + 'static,
    {
        Stream(Box::new(FilterNode { inner: self.0, predicate }))
    }

    /// The `filter`+`map` combination: keeps and transforms elements for which `f`
    /// returns `Some`.
    pub fn collect<O2, F>(self, f: F) -> Stream<O2>
    where
        O: Clone,
        O2: Send + 'static,
        F: FnMut(&O) -> Option<O2> + Send + 'static,
    {
        Stream(Box::new(CollectNode { inner: self.0, f }))
    }

    /// Sequential chunk-wise fold that also emits every intermediate accumulator,
    /// seeded with `z`.
    pub fn scan<O2, F>(self, z: O2, f: F) -> Stream<O2>
    where
        O: Clone,
        O2: Clone + Send + 'static,
        F: FnMut(O2, &O) -> O2 + Send + 'static,
    {
        Stream(Box::new(ScanNode { inner: self.0, f, acc: Some(z) }))
    }

    /// Like `scan`, but seeded from the stream's own first element.
    pub fn scan1<F>(self, f: F) -> Stream<O>
    where
        O: Clone,
        F: FnMut(O, &O) -> O + Send + 'static,
    {
        Stream(Box::new(Scan1Node { inner: self.0, f, acc: None }))
    }

    /// Re-groups this stream's own output into one chunk per upstream chunk.
    pub fn chunks(self) -> Stream<Chunk<O>> {
        Stream(Box::new(ChunksNode { inner: self.0 }))
    }

    /// Rebuilds output into exactly-`n`-sized chunks. `allow_fewer` controls whether a
    /// trailing partial chunk is still emitted.
    pub fn chunk_n(self, n: usize, allow_fewer: bool) -> Stream<O>
    where
        O: Clone,
    {
        Stream(Box::new(ChunkNNode { inner: self.0, n: n.max(1), allow_fewer, buffer: Chunk::empty() }))
    }

    /// Splits (never coalesces) any upstream chunk larger than `limit` — the one
    /// rebalancing knob the Non-goals leave in (§1).
    pub fn chunk_limit(self, limit: usize) -> Stream<O> {
        Stream(Box::new(ChunkLimitNode { inner: self.0, limit: limit.max(1) }))
    }

    /// Transforms whole chunks at a time rather than elements.
    pub fn map_chunks<O2, F>(self, f: F) -> Stream<O2>
    where
        O2: Send + 'static,
        F: FnMut(Chunk<O>) -> Chunk<O2> + Send + 'static,
    {
        Stream(Box::new(MapChunksNode { inner: self.0, f }))
    }

    /// Inserts `sep` between consecutive elements, tracking the one bit of state needed
    /// across chunk boundaries.
    pub fn intersperse(self, sep: O) -> Stream<O>
    where
        O: Clone,
    {
        Stream(Box::new(IntersperseNode { inner: self.0, sep, started: false }))
    }

    /// Runs the upstream one chunk ahead on a forked fiber (§4.6). The fiber is torn
    /// down via the enclosing scope's finalizer list like any other spawned fiber.
    pub fn prefetch(self) -> Stream<O>
    where
        O: Send + Sync + 'static,
    {
        Stream(Box::new(PrefetchNode::new(self.0)))
    }

    /// The privileged `uncons` entry point (§4.4).
    pub async fn uncons(self, scope: Scope) -> StreamResult<Option<(Chunk<O>, Stream<O>)>> {
        match pull::uncons(self.0, scope).await? {
            pull::UnconsOutcome::Some(chunk, tail) => Ok(Some((chunk, Stream(tail)))),
            pull::UnconsOutcome::None => Ok(None),
            pull::UnconsOutcome::Interrupted(tok, err) => {
                Err(err.unwrap_or_else(|| StreamError::msg(format!("uncons interrupted by scope {tok:?}"))))
            }
        }
    }
}

impl<A: Send + 'static> Stream<A> {
    /// Alternately `uncons`s both sides, zipping element-wise, stopping without error
    /// the instant either side is exhausted.
    pub fn zip<B: Send + 'static>(self, other: Stream<B>) -> Stream<(A, B)>
    where
        A: Clone,
        B: Clone,
    {
        self.zip_with(other, |a, b| (a, b))
    }

    pub fn zip_with<B, O2, F>(self, other: Stream<B>, f: F) -> Stream<O2>
    where
        A: Clone,
        B: Send + 'static + Clone,
        O2: Send + 'static,
        F: FnMut(A, B) -> O2 + Send + 'static,
    {
        Stream(Box::new(ZipWithNode {
            left: self.0,
            right: other.0,
            left_buf: Chunk::empty(),
            right_buf: Chunk::empty(),
            f,
        }))
    }
}

impl<O: Send + 'static> Stream<Chunk<O>> {
    /// Flattens a stream of chunks back into a stream of elements.
    pub fn unchunk(self) -> Stream<O> {
        Stream(Box::new(UnchunkNode { inner: self.0 }))
    }
}

// ---------------------------------------------------------------------------------
// append

struct AppendNode<O> {
    first: BoxPull<O>,
    second: BoxPull<O>,
}

impl<O: Send + 'static> PullTrait<O> for AppendNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match self.first.step(scope).await? {
                StepOutcome::Output(chunk, s, tail) => {
                    Ok(StepOutcome::Output(chunk, s, Box::new(AppendNode { first: tail, second: self.second })))
                }
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Done(s) => self.second.step(s).await,
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// map

struct MapNode<I, O, F> {
    inner: BoxPull<I>,
    f: F,
}

impl<I, O, F> PullTrait<O> for MapNode<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(&I) -> O + Send + 'static,
{
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    let mapped = chunk.map(|o| (self.f)(o));
                    Ok(StepOutcome::Output(mapped, s, Box::new(MapNode { inner: tail, f: self.f })))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// flatMap

struct FlatMapNode<I, O, F> {
    inner: BoxPull<I>,
    f: F,
    current: Option<BoxPull<O>>,
    pending: std::collections::VecDeque<I>,
}

impl<I, O, F> PullTrait<O> for FlatMapNode<I, O, F>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Stream<O> + Send + 'static,
{
    fn step(mut self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            loop {
                if let Some(cur) = self.current.take() {
                    match cur.step(scope.clone()).await? {
                        StepOutcome::Output(chunk, s, tail) => {
                            self.current = Some(tail);
                            return Ok(StepOutcome::Output(chunk, s, self));
                        }
                        StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                        StepOutcome::Done(s) => {
                            scope = s;
                            continue;
                        }
                    }
                }
                if let Some(elem) = self.pending.pop_front() {
                    self.current = Some((self.f)(elem).into_pull());
                    continue;
                }
                match self.inner.step(scope.clone()).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        self.inner = tail;
                        scope = s;
                        self.pending.extend(chunk.iter().cloned());
                        continue;
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// handleErrorWith / attempt

struct HandleErrorWithNode<O, F> {
    inner: Option<BoxPull<O>>,
    handler: Option<F>,
}

impl<O, F> PullTrait<O> for HandleErrorWithNode<O, F>
where
    O: Send + 'static,
    F: FnOnce(StreamError) -> Stream<O> + Send + 'static,
{
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let inner = self.inner.take().expect("HandleErrorWithNode stepped after exhaustion");
            match inner.step(scope.clone()).await {
                Ok(StepOutcome::Output(chunk, s, tail)) => {
                    self.inner = Some(tail);
                    Ok(StepOutcome::Output(chunk, s, self))
                }
                Ok(StepOutcome::Done(s)) => Ok(StepOutcome::Done(s)),
                Ok(StepOutcome::Interrupted(t, e)) => Ok(StepOutcome::Interrupted(t, e)),
                Err(e) => {
                    let handler = self.handler.take().expect("handler already consumed");
                    handler(e).into_pull().step(scope).await
                }
            }
        })
    }
}

struct AttemptNode<O> {
    inner: Option<BoxPull<O>>,
}

impl<O: Clone + Send + 'static> PullTrait<Result<O, StreamError>> for AttemptNode<O> {
    fn step(
        mut self: Box<Self>,
        scope: Scope,
    ) -> BoxFuture<'static, StreamResult<StepOutcome<Result<O, StreamError>>>> {
        Box::pin(async move {
            let inner = self.inner.take().expect("AttemptNode stepped after exhaustion");
            match inner.step(scope.clone()).await {
                Ok(StepOutcome::Output(chunk, s, tail)) => {
                    let mapped = chunk.map(|o| Ok(o.clone()));
                    Ok(StepOutcome::Output(mapped, s, Box::new(AttemptNode { inner: Some(tail) })))
                }
                Ok(StepOutcome::Done(s)) => Ok(StepOutcome::Done(s)),
                Ok(StepOutcome::Interrupted(t, e)) => Ok(StepOutcome::Interrupted(t, e)),
                Err(e) => Ok(StepOutcome::Output(Chunk::single(Err(e)), scope, Box::new(DoneNode))),
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// scope / interruptScope

enum ScopedState<O> {
    NotStarted(BoxPull<O>, bool),
    Running(Option<BoxPull<O>>, Scope),
}

struct ScopedNode<O> {
    state: ScopedState<O>,
}

impl<O> ScopedNode<O> {
    fn new(inner: BoxPull<O>, interruptible: bool) -> Self {
        ScopedNode { state: ScopedState::NotStarted(inner, interruptible) }
    }
}

impl<O: Send + 'static> PullTrait<O> for ScopedNode<O> {
    fn step(self: Box<Self>, parent: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let (inner_opt, child) = match self.state {
                ScopedState::Running(inner_opt, child) => (inner_opt, child),
                ScopedState::NotStarted(inner, interruptible) => {
                    (Some(inner), parent.open_child(interruptible)?)
                }
            };
            let inner = match inner_opt {
                Some(i) => i,
                None => {
                    child.close(ExitCase::Succeeded).await?;
                    return Ok(StepOutcome::Done(parent));
                }
            };
            match inner.step(child.clone()).await {
                Ok(StepOutcome::Output(chunk, s, tail)) => Ok(StepOutcome::Output(
                    chunk,
                    parent,
                    Box::new(ScopedNode { state: ScopedState::Running(Some(tail), s) }),
                )),
                Ok(StepOutcome::Done(_)) => {
                    child.close(ExitCase::Succeeded).await?;
                    Ok(StepOutcome::Done(parent))
                }
                Ok(StepOutcome::Interrupted(tok, err)) => {
                    child.close(ExitCase::Canceled).await.ok();
                    Ok(StepOutcome::Interrupted(tok, err))
                }
                Err(e) => {
                    child.close(ExitCase::Failed(e.clone())).await.ok();
                    Err(e)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// translate

struct TranslateNode<O> {
    inner: Option<BoxPull<O>>,
    runtime: Arc<dyn Runtime>,
}

impl<O: Send + 'static> PullTrait<O> for TranslateNode<O> {
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            if scope.is_interruptible() && !self.runtime.supports_interrupt() {
                return Err(StreamError::Translation("fiber spawning (interrupt watcher)"));
            }
            let inner = self.inner.take().expect("TranslateNode stepped after exhaustion");
            let translated_scope = scope.open_child_with_runtime(scope.is_interruptible(), self.runtime.clone())?;
            match inner.step(translated_scope).await? {
                StepOutcome::Output(chunk, _s, tail) => {
                    trace!("translate: emitted chunk under new runtime");
                    Ok(StepOutcome::Output(
                        chunk,
                        scope,
                        Box::new(TranslateNode { inner: Some(tail), runtime: self.runtime }),
                    ))
                }
                StepOutcome::Done(_) => Ok(StepOutcome::Done(scope)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// take / takeWhile / drop / dropWhile

struct TakeNode<O> {
    inner: BoxPull<O>,
    remaining: usize,
}

impl<O: Clone + Send + 'static> PullTrait<O> for TakeNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            if self.remaining == 0 {
                return Ok(StepOutcome::Done(scope));
            }
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    if chunk.len() < self.remaining {
                        let remaining = self.remaining - chunk.len();
                        Ok(StepOutcome::Output(chunk, s, Box::new(TakeNode { inner: tail, remaining })))
                    } else {
                        let taken = chunk.take(self.remaining);
                        Ok(StepOutcome::Output(taken, s, Box::new(DoneNode)))
                    }
                }
            }
        })
    }
}

struct TakeWhileNode<O, F> {
    inner: Option<BoxPull<O>>,
    predicate: F,
    include_failure: bool,
}

impl<O, F> PullTrait<O> for TakeWhileNode<O, F>
where
    O: Clone + Send + 'static,
    F: FnMut(&O) -> bool + Send + 'static,
{
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let inner = match self.inner.take() {
                Some(i) => i,
                None => return Ok(StepOutcome::Done(scope)),
            };
            match inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    let mut cut = chunk.len();
                    let mut stop = false;
                    for i in 0..chunk.len() {
                        if !(self.predicate)(chunk.get(i).unwrap()) {
                            cut = if self.include_failure { i + 1 } else { i };
                            stop = true;
                            break;
                        }
                    }
                    let out = chunk.take(cut);
                    if stop {
                        Ok(StepOutcome::Output(out, s, Box::new(DoneNode)))
                    } else {
                        self.inner = Some(tail);
                        Ok(StepOutcome::Output(out, s, self))
                    }
                }
            }
        })
    }
}

struct DropNode<O> {
    inner: BoxPull<O>,
    remaining: usize,
}

impl<O: Clone + Send + 'static> PullTrait<O> for DropNode<O> {
    fn step(self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let mut inner = self.inner;
            let mut remaining = self.remaining;
            loop {
                match inner.step(scope).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        if remaining == 0 {
                            return Ok(StepOutcome::Output(chunk, s, tail));
                        }
                        if chunk.len() <= remaining {
                            remaining -= chunk.len();
                            inner = tail;
                            scope = s;
                            continue;
                        } else {
                            let rest = chunk.drop(remaining);
                            return Ok(StepOutcome::Output(rest, s, tail));
                        }
                    }
                }
            }
        })
    }
}

struct DropWhileNode<O, F> {
    inner: Option<BoxPull<O>>,
    predicate: F,
    dropping: bool,
}

impl<O, F> PullTrait<O> for DropWhileNode<O, F>
where
    O: Clone + Send + 'static,
    F: FnMut(&O) -> bool + Send + 'static,
{
    fn step(mut self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let mut inner = self.inner.take().expect("DropWhileNode stepped after exhaustion");
            loop {
                match inner.step(scope).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        if !self.dropping {
                            return Ok(StepOutcome::Output(chunk, s, tail));
                        }
                        let mut cut = 0;
                        while cut < chunk.len() && (self.predicate)(chunk.get(cut).unwrap()) {
                            cut += 1;
                        }
                        if cut == chunk.len() {
                            inner = tail;
                            scope = s;
                            continue;
                        }
                        self.dropping = false;
                        let out = chunk.drop(cut);
                        self.inner = Some(tail);
                        return Ok(StepOutcome::Output(out, s, self));
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// filter / collect

struct FilterNode<O, F> {
    inner: BoxPull<O>,
    predicate: F,
}

impl<O, F> PullTrait<O> for FilterNode<O, F>
where
    O: Clone + Send + 'static,
    F: FnMut(&O) -> bool + Send + 'static,
{
    fn step(mut self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            loop {
                match self.inner.step(scope).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        self.inner = tail;
                        scope = s;
                        let filtered = chunk.filter(|o| (self.predicate)(o));
                        if filtered.is_empty() {
                            continue;
                        }
                        return Ok(StepOutcome::Output(filtered, scope, self));
                    }
                }
            }
        })
    }
}

struct CollectNode<O, O2, F> {
    inner: BoxPull<O>,
    f: F,
    _marker: std::marker::PhantomData<O2>,
}

impl<O, O2, F> CollectNode<O, O2, F> {
    fn wrap(inner: BoxPull<O>, f: F) -> Self {
        CollectNode { inner, f, _marker: std::marker::PhantomData }
    }
}

impl<O, O2, F> PullTrait<O2> for CollectNode<O, O2, F>
where
    O: Clone + Send + 'static,
    O2: Send + 'static,
    F: FnMut(&O) -> Option<O2> + Send + 'static,
{
    fn step(mut self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O2>>> {
        Box::pin(async move {
            loop {
                match self.inner.step(scope).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        self.inner = tail;
                        scope = s;
                        let out: Vec<O2> = chunk.iter().filter_map(|o| (self.f)(o)).collect();
                        if out.is_empty() {
                            continue;
                        }
                        return Ok(StepOutcome::Output(Chunk::from_vec(out), scope, self));
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// scan / scan1

struct ScanNode<O, O2, F> {
    inner: BoxPull<O>,
    f: F,
    acc: Option<O2>,
}

impl<O, O2, F> PullTrait<O2> for ScanNode<O, O2, F>
where
    O: Clone + Send + 'static,
    O2: Clone + Send + 'static,
    F: FnMut(O2, &O) -> O2 + Send + 'static,
{
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O2>>> {
        Box::pin(async move {
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    let mut acc = self.acc.take().expect("ScanNode missing accumulator");
                    let mut out = Vec::with_capacity(chunk.len());
                    for o in chunk.iter() {
                        acc = (self.f)(acc, o);
                        out.push(acc.clone());
                    }
                    Ok(StepOutcome::Output(
                        Chunk::from_vec(out),
                        s,
                        Box::new(ScanNode { inner: tail, f: self.f, acc: Some(acc) }),
                    ))
                }
            }
        })
    }
}

struct Scan1Node<O, F> {
    inner: BoxPull<O>,
    f: F,
    acc: Option<O>,
}

impl<O, F> PullTrait<O> for Scan1Node<O, F>
where
    O: Clone + Send + 'static,
    F: FnMut(O, &O) -> O + Send + 'static,
{
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    let mut acc = self.acc.take();
                    let mut out = Vec::with_capacity(chunk.len());
                    for o in chunk.iter() {
                        acc = Some(match acc {
                            None => o.clone(),
                            Some(a) => (self.f)(a, o),
                        });
                        out.push(acc.clone().unwrap());
                    }
                    Ok(StepOutcome::Output(
                        Chunk::from_vec(out),
                        s,
                        Box::new(Scan1Node { inner: tail, f: self.f, acc }),
                    ))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// chunks / unchunk / chunkN / chunkLimit / mapChunks

struct ChunksNode<O> {
    inner: BoxPull<O>,
}

impl<O: Send + 'static> PullTrait<Chunk<O>> for ChunksNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<Chunk<O>>>> {
        Box::pin(async move {
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    Ok(StepOutcome::Output(Chunk::single(chunk), s, Box::new(ChunksNode { inner: tail })))
                }
            }
        })
    }
}

struct UnchunkNode<O> {
    inner: BoxPull<Chunk<O>>,
}

impl<O: Send + 'static> PullTrait<O> for UnchunkNode<O> {
    fn step(self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let mut inner = self.inner;
            loop {
                match inner.step(scope).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(outer, s, tail) => {
                        let mut flat = Chunk::empty();
                        for c in outer.iter() {
                            flat = flat.concat(c.clone());
                        }
                        if flat.is_empty() {
                            inner = tail;
                            scope = s;
                            continue;
                        }
                        return Ok(StepOutcome::Output(flat, s, Box::new(UnchunkNode { inner: tail })));
                    }
                }
            }
        })
    }
}

struct ChunkNNode<O> {
    inner: BoxPull<O>,
    n: usize,
    allow_fewer: bool,
    buffer: Chunk<O>,
}

impl<O: Clone + Send + 'static> PullTrait<O> for ChunkNNode<O> {
    fn step(self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let mut inner = self.inner;
            let mut buffer = self.buffer;
            let n = self.n;
            let allow_fewer = self.allow_fewer;
            loop {
                if buffer.len() >= n {
                    let emit = buffer.take(n);
                    let rest = buffer.drop(n);
                    return Ok(StepOutcome::Output(
                        emit,
                        scope,
                        Box::new(ChunkNNode { inner, n, allow_fewer, buffer: rest }),
                    ));
                }
                match inner.step(scope).await? {
                    StepOutcome::Done(s) => {
                        if !buffer.is_empty() && allow_fewer {
                            return Ok(StepOutcome::Output(buffer, s, Box::new(DoneNode)));
                        }
                        return Ok(StepOutcome::Done(s));
                    }
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        buffer = buffer.concat(chunk);
                        inner = tail;
                        scope = s;
                        continue;
                    }
                }
            }
        })
    }
}

struct PrependChunkNode<O> {
    chunk: Chunk<O>,
    inner: BoxPull<O>,
}

impl<O: Send + 'static> PullTrait<O> for PrependChunkNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move { Ok(StepOutcome::Output(self.chunk, scope, self.inner)) })
    }
}

struct ChunkLimitNode<O> {
    inner: BoxPull<O>,
    limit: usize,
}

impl<O: Clone + Send + 'static> PullTrait<O> for ChunkLimitNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    if chunk.len() <= self.limit {
                        Ok(StepOutcome::Output(chunk, s, Box::new(ChunkLimitNode { inner: tail, limit: self.limit })))
                    } else {
                        let head = chunk.take(self.limit);
                        let rest = chunk.drop(self.limit);
                        let resumed: BoxPull<O> = Box::new(PrependChunkNode { chunk: rest, inner: tail });
                        Ok(StepOutcome::Output(head, s, Box::new(ChunkLimitNode { inner: resumed, limit: self.limit })))
                    }
                }
            }
        })
    }
}

struct MapChunksNode<I, O, F> {
    inner: BoxPull<I>,
    f: F,
}

impl<I, O, F> PullTrait<O> for MapChunksNode<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(Chunk<I>) -> Chunk<O> + Send + 'static,
{
    fn step(mut self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            loop {
                match self.inner.step(scope).await? {
                    StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                    StepOutcome::Output(chunk, s, tail) => {
                        self.inner = tail;
                        scope = s;
                        let mapped = (self.f)(chunk);
                        if mapped.is_empty() {
                            continue;
                        }
                        return Ok(StepOutcome::Output(mapped, scope, self));
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// intersperse

struct IntersperseNode<O> {
    inner: BoxPull<O>,
    sep: O,
    started: bool,
}

impl<O: Clone + Send + 'static> PullTrait<O> for IntersperseNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match self.inner.step(scope).await? {
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                StepOutcome::Output(chunk, s, tail) => {
                    let mut out = Vec::with_capacity(chunk.len() * 2);
                    let mut started = self.started;
                    for o in chunk.iter() {
                        if started {
                            out.push(self.sep.clone());
                        }
                        out.push(o.clone());
                        started = true;
                    }
                    Ok(StepOutcome::Output(
                        Chunk::from_vec(out),
                        s,
                        Box::new(IntersperseNode { inner: tail, sep: self.sep, started }),
                    ))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// zip / zipWith

struct ZipWithNode<A, B, O2, F> {
    left: BoxPull<A>,
    right: BoxPull<B>,
    left_buf: Chunk<A>,
    right_buf: Chunk<B>,
    f: F,
}

impl<A, B, O2, F> PullTrait<O2> for ZipWithNode<A, B, O2, F>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    O2: Send + 'static,
    F: FnMut(A, B) -> O2 + Send + 'static,
{
    fn step(mut self: Box<Self>, mut scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O2>>> {
        Box::pin(async move {
            loop {
                if self.left_buf.is_empty() {
                    match self.left.step(scope.clone()).await? {
                        StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                        StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                        StepOutcome::Output(c, s, tail) => {
                            self.left = tail;
                            self.left_buf = c;
                            scope = s;
                        }
                    }
                }
                if self.right_buf.is_empty() {
                    match self.right.step(scope.clone()).await? {
                        StepOutcome::Done(s) => return Ok(StepOutcome::Done(s)),
                        StepOutcome::Interrupted(t, e) => return Ok(StepOutcome::Interrupted(t, e)),
                        StepOutcome::Output(c, s, tail) => {
                            self.right = tail;
                            self.right_buf = c;
                            scope = s;
                        }
                    }
                }
                let n = self.left_buf.len().min(self.right_buf.len());
                if n == 0 {
                    continue;
                }
                let mut out = Vec::with_capacity(n);
                for i in 0..n {
                    let a = self.left_buf.get(i).unwrap().clone();
                    let b = self.right_buf.get(i).unwrap().clone();
                    out.push((self.f)(a, b));
                }
                self.left_buf = self.left_buf.drop(n);
                self.right_buf = self.right_buf.drop(n);
                return Ok(StepOutcome::Output(Chunk::from_vec(out), scope, self));
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// prefetch

enum PrefetchState<O> {
    NotStarted(BoxPull<O>),
    Running(Arc<BoundedQueue<Chunk<O>>>),
}

pub(crate) struct PrefetchNode<O> {
    state: PrefetchState<O>,
}

impl<O: Send + Sync + 'static> PrefetchNode<O> {
    fn new(inner: BoxPull<O>) -> Self {
        PrefetchNode { state: PrefetchState::NotStarted(inner) }
    }
}

impl<O: Send + Sync + 'static> PullTrait<O> for PrefetchNode<O> {
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let queue = match self.state {
                PrefetchState::Running(q) => q,
                PrefetchState::NotStarted(inner) => {
                    let queue: Arc<BoundedQueue<Chunk<O>>> = Arc::new(BoundedQueue::bounded(1));
                    let queue_for_fiber = queue.clone();
                    let runtime = scope.runtime();
                    let fiber_scope = scope.clone();
                    let fiber = runtime.spawn(Box::pin(async move {
                        let mut cur = inner;
                        let mut cur_scope = fiber_scope;
                        loop {
                            match cur.step(cur_scope.clone()).await {
                                Ok(StepOutcome::Output(chunk, s, tail)) => {
                                    cur_scope = s;
                                    cur = tail;
                                    if queue_for_fiber.offer(chunk).await.is_err() {
                                        break;
                                    }
                                }
                                _ => break,
                            }
                        }
                        queue_for_fiber.close();
                    }));
                    let fiber_cell = parking_lot::Mutex::new(Some(fiber));
                    scope.register_finalizer(move |_ec| {
                        if let Some(f) = fiber_cell.lock().take() {
                            f.cancel();
                        }
                        Box::pin(async { Ok(()) })
                    })?;
                    queue
                }
            };
            match queue.take().await {
                Some(chunk) => {
                    Ok(StepOutcome::Output(chunk, scope, Box::new(PrefetchNode { state: PrefetchState::Running(queue) })))
                }
                None => Ok(StepOutcome::Done(scope)),
            }
        })
    }
}
