//! Concurrent `Stream` combinators (§4.5, §4.7): `par_join`, `merge`/`merge_halt_*`,
//! `observe`, `interrupt_when`, `concurrently`, `broadcast_through`, `par_eval_map`/
//! `par_eval_map_unordered`.
//!
//! Every one of these forks fibers via `Scope::runtime()` — the current scope is the
//! thing that knows how to fork more work — and tears a forked fiber down through the
//! same finalizer list ordinary resources use. Transport is `queue.rs`'s `BoundedQueue`
//! (output plumbing) and `pubsub.rs`'s `Broadcast` strategy (fan-out).
//!
//! A `Stream<Stream<O>>` nested-stream signature doesn't fit Rust's ownership model for
//! `flat_map`, whose bound is `O: Clone` on the *outer* stream's element type (see
//! `combinators.rs`) — and a `Stream<O>`, a linear Pull program often closing over a
//! non-`Clone` future, cannot be `Clone`, so nothing here ever `flat_map`s over one.
//! `par_join` and the combinators built on it instead take an owned `Vec<Stream<O>>` (or
//! any `IntoIterator`), the same adaptation `futures::stream::select_all`/
//! `FuturesUnordered` make for the same reason. `broadcast` is the one place a
//! `Stream<Stream<O>>` value is actually produced (§6); its single chunk of subscriptions
//! is unpacked with `Chunk::into_vec` (owned extraction without requiring `Clone`, valid
//! since the chunk is freshly built and held nowhere else) rather than `Chunk::to_vec`.
//! See DESIGN.md.
//!
//! Every concurrent combinator that forks fibers also races its worker loops against a
//! `Deferred`-backed kill/stop signal and registers a finalizer on the scope it was handed
//! so that an error in one fiber, or the early closing of that scope, tears down every
//! sibling fiber instead of leaving it running to completion untouched.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::chunk::Chunk;
use crate::combinators::Stream;
use crate::deferred::Deferred;
use crate::error::{ExitCase, StreamError, StreamResult};
use crate::pubsub::{new_broadcast, Broadcast};
use crate::pull::{step_leg, BoxPull, PullTrait, StepOutcome};
use crate::queue::BoundedQueue;
use crate::runtime::Fiber;
use crate::scope::{EvalOutcome, Scope};
use crate::topic::{Signal, TopicSubscription};

type Outbox<O> = Arc<BoundedQueue<StreamResult<Chunk<O>>>>;

/// Registers a finalizer on `scope` that cancels `fiber` (and completes `stop`, if any
/// cooperating workers still select against it) the instant the scope closes early —
/// e.g. the joined stream is wrapped in `.take(n)` and dropped before its workers finish
/// on their own. Mirrors `combinators.rs`'s `PrefetchNode` finalizer shape.
fn register_teardown_finalizer(
    scope: &Scope,
    fiber: Fiber,
    stop: Option<Deferred<()>>,
) -> StreamResult<()> {
    let cell = Mutex::new(Some(fiber));
    scope.register_finalizer(move |_ec| {
        Box::pin(async move {
            if let Some(stop) = &stop {
                let _ = stop.complete(());
            }
            if let Some(fiber) = cell.lock().take() {
                fiber.join().await;
            }
            Ok(())
        })
    })?;
    Ok(())
}

/// Drains `pull` chunk by chunk into `outbox` via the `stepLeg` primitive (§4.4), so the
/// tail always resumes in the scope it was actually stepped from rather than one this
/// lane hand-tracks itself. Stops (without reporting an error of its own) the instant
/// `outbox.offer` fails — that only happens once the consumer side has already closed the
/// queue — or the instant `stop` fires, which happens the moment any sibling lane errors
/// (§4.5's kill-signal semantics: the first error wins and every lane tears down). An
/// error raised by `pull` itself is forwarded into `outbox` and also completes `stop`, so
/// every other lane observes it too.
async fn run_lane<O: Send + 'static>(pull: BoxPull<O>, scope: Scope, outbox: Outbox<O>, stop: Deferred<()>) {
    let mut next = tokio::select! {
        res = step_leg(pull, scope) => res,
        _ = stop.get() => return,
    };
    loop {
        let leg = match next {
            Ok(Some(leg)) => leg,
            Ok(None) => return,
            Err(e) => {
                let _ = outbox.offer(Err(e)).await;
                let _ = stop.complete(());
                return;
            }
        };
        let head = leg.head.clone();
        if outbox.offer(Ok(head)).await.is_err() {
            return;
        }
        next = tokio::select! {
            res = leg.next() => res,
            _ = stop.get() => return,
        };
    }
}

/// Reads chunks out of `outbox`, turning the first `Err` it sees into the stream's own
/// failure. Shared by every combinator below that funnels worker-fiber output through a
/// single queue.
struct OutboxNode<O> {
    outbox: Outbox<O>,
}

impl<O: Send + 'static> PullTrait<O> for OutboxNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            match self.outbox.take().await {
                None => Ok(StepOutcome::Done(scope)),
                Some(Ok(chunk)) => {
                    Ok(StepOutcome::Output(chunk, scope, Box::new(OutboxNode { outbox: self.outbox })))
                }
                Some(Err(e)) => Err(e),
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// parJoin

enum JoinState<O> {
    NotStarted(Vec<Stream<O>>, usize),
    Running(BoxPull<O>),
}

struct ParJoinNode<O> {
    state: JoinState<O>,
}

impl<O: Send + 'static> PullTrait<O> for ParJoinNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let inner = match self.state {
                JoinState::Running(inner) => inner,
                JoinState::NotStarted(streams, max_open) => {
                    let outbox: Outbox<O> = Arc::new(BoundedQueue::bounded(max_open.max(1)));
                    let stop: Deferred<()> = Deferred::new();
                    let supervisor =
                        spawn_par_join_supervisor(scope.clone(), streams, max_open, outbox.clone(), stop.clone());
                    register_teardown_finalizer(&scope, supervisor, Some(stop))?;
                    Box::new(OutboxNode { outbox })
                }
            };
            match inner.step(scope.clone()).await? {
                StepOutcome::Output(chunk, s, tail) => {
                    Ok(StepOutcome::Output(chunk, s, Box::new(ParJoinNode { state: JoinState::Running(tail) })))
                }
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
            }
        })
    }
}

/// Admits up to `max_open` lanes at a time, each draining its stream into `outbox` via
/// [`run_lane`]. Every lane shares one `stop` signal: the first lane to error completes it
/// (inside `run_lane`), and the admission loop itself also races the semaphore against
/// `stop` so no further lane is even started once one has failed. Returns the supervisor's
/// own fiber so the caller can register a teardown finalizer on it.
fn spawn_par_join_supervisor<O: Send + 'static>(
    scope: Scope,
    streams: Vec<Stream<O>>,
    max_open: usize,
    outbox: Outbox<O>,
    stop: Deferred<()>,
) -> Fiber {
    scope.runtime().spawn(Box::pin(async move {
        let semaphore = Arc::new(Semaphore::new(max_open.max(1)));
        let mut handles = Vec::with_capacity(streams.len());
        for stream in streams {
            let permit = tokio::select! {
                p = semaphore.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = stop.get() => break,
            };
            let lane_scope = match scope.open_child(false) {
                Ok(s) => s,
                Err(e) => {
                    let _ = outbox.offer(Err(e)).await;
                    let _ = stop.complete(());
                    break;
                }
            };
            let outbox = outbox.clone();
            let stop = stop.clone();
            let fiber = scope.runtime().spawn(Box::pin(async move {
                let _permit = permit;
                run_lane(stream.into_pull(), lane_scope.clone(), outbox, stop).await;
                lane_scope.close(ExitCase::Succeeded).await.ok();
            }));
            handles.push(fiber);
        }
        for fiber in handles {
            fiber.join().await;
        }
        trace!("parJoin: all lanes finished, closing output");
        outbox.close();
    }))
}

/// Joins up to `max_open` streams concurrently, waiting for every one of them to finish
/// before ending (§4.5).
pub fn par_join<O, I>(max_open: usize, streams: I) -> Stream<O>
where
    O: Send + 'static,
    I: IntoIterator<Item = Stream<O>>,
{
    Stream::from_pull(Box::new(ParJoinNode {
        state: JoinState::NotStarted(streams.into_iter().collect(), max_open.max(1)),
    }))
}

// ---------------------------------------------------------------------------------
// merge / mergeHalt*

/// Runs both streams concurrently, ending only once both have ended (§4.5).
pub fn merge<O: Send + 'static>(s1: Stream<O>, s2: Stream<O>) -> Stream<O> {
    par_join(2, [s1, s2])
}

enum HaltWhich {
    Both,
    Left,
    Right,
}

fn spawn_lane<O: Send + 'static>(
    scope: Scope,
    stream: Stream<O>,
    outbox: Outbox<O>,
    stop: Deferred<()>,
) -> (Fiber, Deferred<()>) {
    let done: Deferred<()> = Deferred::new();
    let done_for_fiber = done.clone();
    let fiber = scope.runtime().spawn(Box::pin(async move {
        let mut pull = stream.into_pull();
        let mut cur_scope = scope;
        loop {
            tokio::select! {
                res = pull.step(cur_scope.clone()) => {
                    match res {
                        Ok(StepOutcome::Output(chunk, s, tail)) => {
                            cur_scope = s;
                            pull = tail;
                            if outbox.offer(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Ok(StepOutcome::Done(_)) => break,
                        Ok(StepOutcome::Interrupted(..)) => break,
                        Err(e) => {
                            let _ = outbox.offer(Err(e)).await;
                            break;
                        }
                    }
                }
                _ = stop.get() => break,
            }
        }
        let _ = done_for_fiber.complete(());
    }));
    (fiber, done)
}

fn merge_halt<O: Send + 'static>(which: HaltWhich, s1: Stream<O>, s2: Stream<O>) -> Stream<O> {
    enum MergeHaltState<O> {
        NotStarted(HaltWhich, Stream<O>, Stream<O>),
        Running(BoxPull<O>),
    }

    struct MergeHaltNode<O> {
        state: MergeHaltState<O>,
    }

    impl<O: Send + 'static> PullTrait<O> for MergeHaltNode<O> {
        fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
            Box::pin(async move {
                let inner = match self.state {
                    MergeHaltState::Running(inner) => inner,
                    MergeHaltState::NotStarted(which, s1, s2) => {
                        let outbox: Outbox<O> = Arc::new(BoundedQueue::bounded(2));
                        let stop: Deferred<()> = Deferred::new();
                        let lane1_scope = scope.open_child(false)?;
                        let lane2_scope = scope.open_child(false)?;
                        let (fiber1, done1) = spawn_lane(lane1_scope, s1, outbox.clone(), stop.clone());
                        let (fiber2, done2) = spawn_lane(lane2_scope, s2, outbox.clone(), stop.clone());
                        let outbox_for_sup = outbox.clone();
                        scope.runtime().spawn(Box::pin(async move {
                            match which {
                                HaltWhich::Both => {
                                    tokio::select! {
                                        _ = done1.get() => {}
                                        _ = done2.get() => {}
                                    }
                                }
                                HaltWhich::Left => {
                                    done1.get().await;
                                }
                                HaltWhich::Right => {
                                    done2.get().await;
                                }
                            }
                            let _ = stop.complete(());
                            fiber1.join().await;
                            fiber2.join().await;
                            outbox_for_sup.close();
                        }));
                        Box::new(OutboxNode { outbox })
                    }
                };
                match inner.step(scope.clone()).await? {
                    StepOutcome::Output(chunk, s, tail) => Ok(StepOutcome::Output(
                        chunk,
                        s,
                        Box::new(MergeHaltNode { state: MergeHaltState::Running(tail) }),
                    )),
                    StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                    StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
                }
            })
        }
    }

    Stream::from_pull(Box::new(MergeHaltNode { state: MergeHaltState::NotStarted(which, s1, s2) }))
}

/// Like [`merge`], but ends as soon as *either* side ends, cancelling the other.
pub fn merge_halt_both<O: Send + 'static>(s1: Stream<O>, s2: Stream<O>) -> Stream<O> {
    merge_halt(HaltWhich::Both, s1, s2)
}

/// Ends once `s1` ends, cancelling `s2` if it is still running.
pub fn merge_halt_l<O: Send + 'static>(s1: Stream<O>, s2: Stream<O>) -> Stream<O> {
    merge_halt(HaltWhich::Left, s1, s2)
}

/// Ends once `s2` ends, cancelling `s1` if it is still running.
pub fn merge_halt_r<O: Send + 'static>(s1: Stream<O>, s2: Stream<O>) -> Stream<O> {
    merge_halt(HaltWhich::Right, s1, s2)
}

// ---------------------------------------------------------------------------------
// interruptWhen

/// Stops `source` early the first time `signal` reports `true` (§4.5). Unlike the
/// source's `s ++ exec(signal.get.flatMap(scope.interrupt))` shorthand — which would only
/// run the watcher *after* `s` already finished, never actually cutting it short — this
/// forks the watcher onto its own fiber racing concurrently with `source`, which is the
/// only rendition that actually interrupts a still-running stream (DESIGN.md).
pub fn interrupt_when<O: Send + 'static>(source: Stream<O>, signal: Arc<Signal<bool>>) -> Stream<O> {
    Stream::from_pull(Box::new(InterruptWhenNode {
        inner: Some(source.into_pull()),
        signal,
        scope: None,
    }))
}

struct InterruptWhenNode<O> {
    inner: Option<BoxPull<O>>,
    signal: Arc<Signal<bool>>,
    scope: Option<Scope>,
}

impl<O: Send + 'static> PullTrait<O> for InterruptWhenNode<O> {
    fn step(mut self: Box<Self>, parent: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let child = match self.scope.clone() {
                Some(c) => c,
                None => {
                    let child = parent.open_child(true)?;
                    let signal = self.signal.clone();
                    let watch_scope = child.clone();
                    child.runtime().spawn(Box::pin(async move {
                        let mut current = signal.get();
                        while !current {
                            current = signal.changes().await;
                        }
                        watch_scope.interrupt(None).await;
                    }));
                    self.scope = Some(child.clone());
                    child
                }
            };
            let inner = self.inner.take().expect("InterruptWhenNode stepped after exhaustion");
            match inner.step(child.clone()).await {
                Ok(StepOutcome::Output(chunk, _s, tail)) => {
                    self.inner = Some(tail);
                    Ok(StepOutcome::Output(chunk, parent, self))
                }
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
// concurrently

/// Runs `bg` as a side-fiber for as long as `foreground` runs: a failure in `bg`
/// interrupts `foreground`, and `foreground` finishing (in any way) cancels `bg` (§4.5).
pub fn concurrently<O, Bg>(foreground: Stream<O>, bg: Stream<Bg>) -> Stream<O>
where
    O: Send + 'static,
    Bg: Send + 'static,
{
    Stream::from_pull(Box::new(ConcurrentlyNode {
        foreground: Some(foreground.into_pull()),
        bg: Some(bg.into_pull()),
        state: None,
    }))
}

struct ConcurrentlyState {
    fiber: Fiber,
    kill: Deferred<StreamError>,
}

struct ConcurrentlyNode<O, Bg> {
    foreground: Option<BoxPull<O>>,
    bg: Option<BoxPull<Bg>>,
    state: Option<ConcurrentlyState>,
}

impl<O: Send + 'static, Bg: Send + 'static> PullTrait<O> for ConcurrentlyNode<O, Bg> {
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let ConcurrentlyState { fiber, kill } = match self.state.take() {
                Some(s) => s,
                None => {
                    let bg_pull = self.bg.take().expect("concurrently: bg already started");
                    let bg_scope = scope.open_child(false)?;
                    let kill: Deferred<StreamError> = Deferred::new();
                    let kill_for_fiber = kill.clone();
                    let fiber = scope.runtime().spawn(Box::pin(async move {
                        let mut pull = bg_pull;
                        let mut cur_scope = bg_scope.clone();
                        loop {
                            match pull.step(cur_scope.clone()).await {
                                Ok(StepOutcome::Output(_chunk, s, tail)) => {
                                    cur_scope = s;
                                    pull = tail;
                                }
                                Ok(StepOutcome::Done(_)) => break,
                                Ok(StepOutcome::Interrupted(..)) => break,
                                Err(e) => {
                                    let _ = kill_for_fiber.complete(e);
                                    break;
                                }
                            }
                        }
                        bg_scope.close(ExitCase::Succeeded).await.ok();
                    }));
                    ConcurrentlyState { fiber, kill }
                }
            };

            if let Some(err) = kill.try_get() {
                return Err(err);
            }

            let inner = self.foreground.take().expect("concurrently: foreground stepped after exhaustion");
            match inner.step(scope.clone()).await {
                Ok(StepOutcome::Output(chunk, s, tail)) => {
                    self.foreground = Some(tail);
                    self.state = Some(ConcurrentlyState { fiber, kill });
                    Ok(StepOutcome::Output(chunk, s, self))
                }
                Ok(StepOutcome::Done(s)) => {
                    fiber.cancel();
                    Ok(StepOutcome::Done(s))
                }
                Ok(StepOutcome::Interrupted(t, e)) => {
                    fiber.cancel();
                    Ok(StepOutcome::Interrupted(t, e))
                }
                Err(e) => {
                    fiber.cancel();
                    Err(e)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// observe

/// Runs `sink` against every element of `source` on a forked fiber, synchronizing so that
/// the sink has seen (and acknowledged) each chunk before it is emitted downstream; the
/// sink's own pace throttles `source` exactly like any other single-element channel would
/// (§4.7).
pub fn observe<O, F, Fut>(source: Stream<O>, sink: F) -> Stream<O>
where
    O: Send + 'static,
    F: FnMut(Chunk<O>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    Stream::from_pull(Box::new(ObserveNode {
        state: ObserveState::NotStarted(source.into_pull(), sink),
    }))
}

enum ObserveState<O, F> {
    NotStarted(BoxPull<O>, F),
    Running(BoxPull<O>, Arc<BoundedQueue<Chunk<O>>>, Arc<BoundedQueue<StreamResult<()>>>),
}

struct ObserveNode<O, F> {
    state: ObserveState<O, F>,
}

impl<O, F, Fut> PullTrait<O> for ObserveNode<O, F>
where
    O: Send + 'static,
    F: FnMut(Chunk<O>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let (inner, in_q, ack_q) = match self.state {
                ObserveState::Running(inner, in_q, ack_q) => (inner, in_q, ack_q),
                ObserveState::NotStarted(inner, mut sink) => {
                    let in_q: Arc<BoundedQueue<Chunk<O>>> = Arc::new(BoundedQueue::bounded(1));
                    let ack_q: Arc<BoundedQueue<StreamResult<()>>> = Arc::new(BoundedQueue::unbounded());
                    let in_q_for_fiber = in_q.clone();
                    let ack_q_for_fiber = ack_q.clone();
                    scope.runtime().spawn(Box::pin(async move {
                        while let Some(chunk) = in_q_for_fiber.take().await {
                            let result = sink(chunk).await;
                            if ack_q_for_fiber.offer(result).await.is_err() {
                                break;
                            }
                        }
                    }));
                    (inner, in_q, ack_q)
                }
            };
            match inner.step(scope.clone()).await? {
                StepOutcome::Done(s) => {
                    in_q.close();
                    Ok(StepOutcome::Done(s))
                }
                StepOutcome::Interrupted(t, e) => {
                    in_q.close();
                    Ok(StepOutcome::Interrupted(t, e))
                }
                StepOutcome::Output(chunk, s, tail) => {
                    in_q.offer(chunk.clone()).await?;
                    match ack_q.take().await {
                        Some(Ok(())) => Ok(StepOutcome::Output(
                            chunk,
                            s,
                            Box::new(ObserveNode { state: ObserveState::Running(tail, in_q, ack_q) }),
                        )),
                        Some(Err(e)) => Err(e),
                        None => Err(StreamError::msg("observe: sink fiber ended early")),
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------------
// broadcast / broadcastThrough

/// Spawns the publisher fiber and builds `num_subscribers` independent subscription
/// streams over a fresh `Broadcast` (§4.5's `PubSub` lockstep strategy): publishing is
/// held until every subscription is registered (`awaitSub(num_subscribers)`), so none of
/// them miss the first element, and each subscription stream is wrapped in
/// `interrupt_when` against a `done` signal the publisher flips once `source` is
/// exhausted, so they end instead of parking forever on a broker nobody publishes to
/// again. Shared by [`broadcast`] and [`broadcast_through`].
fn open_broadcast<O: Clone + Send + 'static>(
    scope: &Scope,
    source: BoxPull<O>,
    num_subscribers: usize,
) -> StreamResult<Vec<Stream<O>>> {
    let broker: Arc<Broadcast<O>> = new_broadcast(num_subscribers);
    let done = Signal::of(false);

    let publisher_scope = scope.open_child(false)?;
    let broker_for_pub = broker.clone();
    let done_for_pub = done.clone();
    scope.runtime().spawn(Box::pin(async move {
        let mut pull = source;
        let mut cur_scope = publisher_scope.clone();
        loop {
            match pull.step(cur_scope.clone()).await {
                Ok(StepOutcome::Output(chunk, s, tail)) => {
                    cur_scope = s;
                    pull = tail;
                    for element in chunk.iter() {
                        broker_for_pub.publish(element.clone()).await;
                    }
                }
                _ => break,
            }
        }
        done_for_pub.set(true);
        publisher_scope.close(ExitCase::Succeeded).await.ok();
    }));

    Ok((0..num_subscribers)
        .map(|_| {
            let token = broker.subscribe();
            let sub_stream = Stream::from_pull(Box::new(SelectorNode { broker: broker.clone(), token }));
            interrupt_when(sub_stream, done.clone())
        })
        .collect())
}

/// Fans `source` out to `num_subscribers` independent subscriptions, handing back each
/// one as its own `Stream<O>` (§6): the lower-level primitive `broadcast_through` is
/// built from. Where that runs a caller-supplied pipe over each subscription and joins
/// the results back together, `broadcast` just hands the raw subscriptions back so a
/// caller can do anything it likes with them (including stepping them on different
/// fibers). The result is a single chunk of `num_subscribers` streams — since `Stream<O>`
/// is never `Clone`, consume it by stepping directly and unpacking the chunk with
/// `Chunk::into_vec` (e.g. inside `Compiler::fold_chunks`) rather than through `flat_map`
/// or `to_list` — see the module docs.
pub fn broadcast<O: Clone + Send + 'static>(source: Stream<O>, num_subscribers: usize) -> Stream<Stream<O>> {
    Stream::from_pull(Box::new(BroadcastNode {
        state: Some((source.into_pull(), num_subscribers.max(1))),
    }))
}

struct BroadcastNode<O> {
    state: Option<(BoxPull<O>, usize)>,
}

impl<O: Clone + Send + 'static> PullTrait<Stream<O>> for BroadcastNode<O> {
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<Stream<O>>>> {
        Box::pin(async move {
            let (source, num_subscribers) = self.state.take().expect("broadcast stepped twice");
            let subscriptions = open_broadcast(&scope, source, num_subscribers)?;
            Ok(StepOutcome::Output(Chunk::from_vec(subscriptions), scope, Box::new(crate::pull::DoneNode)))
        })
    }
}

/// Publishes every element of `source` to a `Broadcast` and runs one independent
/// subscription through each of `pipes`, joining their outputs back together (§4.7) —
/// the common case of [`broadcast`] immediately consumed by a fixed set of pipes.
pub fn broadcast_through<O, O2, P>(source: Stream<O>, pipes: Vec<P>) -> Stream<O2>
where
    O: Clone + Send + 'static,
    O2: Send + 'static,
    P: FnOnce(Stream<O>) -> Stream<O2> + Send + 'static,
{
    Stream::from_pull(Box::new(BroadcastThroughNode {
        state: Some((source.into_pull(), pipes)),
        running: None,
    }))
}

struct BroadcastThroughNode<O, O2, P> {
    state: Option<(BoxPull<O>, Vec<P>)>,
    running: Option<BoxPull<O2>>,
}

impl<O, O2, P> PullTrait<O2> for BroadcastThroughNode<O, O2, P>
where
    O: Clone + Send + 'static,
    O2: Send + 'static,
    P: FnOnce(Stream<O>) -> Stream<O2> + Send + 'static,
{
    fn step(mut self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O2>>> {
        Box::pin(async move {
            let inner = match self.running.take() {
                Some(inner) => inner,
                None => {
                    let (source, pipes) = self.state.take().expect("broadcastThrough stepped twice");
                    let subscriptions = open_broadcast(&scope, source, pipes.len())?;
                    let pipe_streams: Vec<Stream<O2>> = pipes
                        .into_iter()
                        .zip(subscriptions)
                        .map(|(pipe, sub_stream)| pipe(sub_stream))
                        .collect();
                    par_join(pipe_streams.len().max(1), pipe_streams).into_pull()
                }
            };
            match inner.step(scope.clone()).await? {
                StepOutcome::Output(chunk, s, tail) => {
                    self.running = Some(tail);
                    Ok(StepOutcome::Output(chunk, s, self))
                }
                StepOutcome::Done(s) => Ok(StepOutcome::Done(s)),
                StepOutcome::Interrupted(t, e) => Ok(StepOutcome::Interrupted(t, e)),
            }
        })
    }
}

/// Reads one broadcast subscriber's feed via `get_and_ack`, racing each read against the
/// ambient scope's interrupt so `interrupt_when` can actually cut it short rather than
/// leaving it parked on a broker nobody publishes to anymore.
struct SelectorNode<O: Clone> {
    broker: Arc<Broadcast<O>>,
    token: crate::token::Token,
}

impl<O: Clone + Send + 'static> PullTrait<O> for SelectorNode<O> {
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let broker = self.broker.clone();
            let token = self.token;
            let fut = async move { Ok(broker.get_and_ack(&token).await) };
            match scope.interruptible_eval(fut).await {
                EvalOutcome::Done(Ok(value)) => Ok(StepOutcome::Output(Chunk::single(value), scope, self)),
                EvalOutcome::Done(Err(e)) => Err(e),
                EvalOutcome::Interrupted(tok, err) => {
                    self.broker.unsubscribe(&self.token);
                    Ok(StepOutcome::Interrupted(tok, err))
                }
            }
        })
    }
}

/// Turns a live `Topic` subscription into a plain `Stream`, reading until the
/// subscription is closed (the topic itself is dropped, or the subscription is
/// explicitly torn down).
pub fn subscribe_stream<O: Clone + Send + 'static>(sub: TopicSubscription<O>) -> Stream<O> {
    crate::constructors::unfold_eval(sub, |sub| async move {
        let next = sub.next().await;
        Ok(next.map(|value| (value, sub)))
    })
}

// ---------------------------------------------------------------------------------
// parEvalMap / parEvalMapUnordered

/// Runs `f` concurrently over `source`'s elements (at most `max_concurrent` in flight),
/// emitting results in the *same order* the inputs arrived, even though they may finish
/// out of order (§4.7).
pub fn par_eval_map<I, O, F, Fut>(source: Stream<I>, max_concurrent: usize, f: F) -> Stream<O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    Stream::from_pull(Box::new(ParEvalMapNode {
        state: ParEvalMapState::NotStarted(source.into_pull(), max_concurrent.max(1), f),
    }))
}

type Slot<O> = Deferred<StreamResult<O>>;

enum ParEvalMapState<I, O, F> {
    NotStarted(BoxPull<I>, usize, F),
    Running(Arc<BoundedQueue<Slot<O>>>),
}

struct ParEvalMapNode<I, O, F> {
    state: ParEvalMapState<I, O, F>,
}

impl<I, O, F, Fut> PullTrait<O> for ParEvalMapNode<I, O, F>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let slots = match self.state {
                ParEvalMapState::Running(slots) => slots,
                ParEvalMapState::NotStarted(source, max_concurrent, f) => {
                    let (slots, feeder) = spawn_par_eval_map_feeder(scope.clone(), source, max_concurrent, f);
                    register_teardown_finalizer(&scope, feeder, None)?;
                    slots
                }
            };
            match slots.take().await {
                None => Ok(StepOutcome::Done(scope)),
                Some(slot) => match slot.get().await {
                    Ok(value) => Ok(StepOutcome::Output(
                        Chunk::single(value),
                        scope,
                        Box::new(ParEvalMapNode { state: ParEvalMapState::Running(slots) }),
                    )),
                    Err(e) => Err(e),
                },
            }
        })
    }
}

/// Feeds `source` through `f`, at most `max_concurrent` calls in flight, preserving
/// input order by handing each caller a `Deferred` slot up front (in the order its input
/// arrived) that the actual worker fiber completes whenever `f` finishes. Every worker
/// races `f`'s future against a shared `kill: Deferred<StreamError>`: the first worker
/// to fail completes it, which stops the feed loop from admitting further items and
/// every other in-flight worker from completing its slot normally — they instead
/// complete it with the same error, so a consumer draining slots in order still observes
/// the failure once it reaches that slot rather than hanging (§4.7's first-error-wins
/// rule). Returns the feeder's own fiber so the caller can tear it (and its workers)
/// down early if the stream is dropped before draining.
fn spawn_par_eval_map_feeder<I, O, F, Fut>(
    scope: Scope,
    source: BoxPull<I>,
    max_concurrent: usize,
    mut f: F,
) -> (Arc<BoundedQueue<Slot<O>>>, Fiber)
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    let slots: Arc<BoundedQueue<Slot<O>>> = Arc::new(BoundedQueue::bounded(max_concurrent.max(1)));
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let slots_for_feeder = slots.clone();
    let kill: Deferred<StreamError> = Deferred::new();
    let feeder = scope.runtime().spawn(Box::pin(async move {
        let mut pull = source;
        let mut cur_scope = scope.clone();
        let mut pending: VecDeque<I> = VecDeque::new();
        let mut workers: Vec<Fiber> = Vec::new();
        'feed: loop {
            while let Some(item) = pending.pop_front() {
                let slot: Slot<O> = Deferred::new();
                if slots_for_feeder.offer(slot.clone()).await.is_err() {
                    break 'feed;
                }
                let permit = tokio::select! {
                    p = semaphore.clone().acquire_owned() => match p {
                        Ok(p) => p,
                        Err(_) => break 'feed,
                    },
                    _ = kill.get() => break 'feed,
                };
                let fut = f(item);
                let kill_for_worker = kill.clone();
                workers.push(scope.runtime().spawn(Box::pin(async move {
                    let _permit = permit;
                    tokio::select! {
                        res = fut => {
                            if let Err(e) = &res {
                                let _ = kill_for_worker.complete(e.clone());
                            }
                            let _ = slot.complete(res);
                        }
                        err = kill_for_worker.get() => {
                            let _ = slot.complete(Err(err));
                        }
                    }
                })));
            }
            let stepped = tokio::select! {
                res = pull.step(cur_scope.clone()) => res,
                _ = kill.get() => break 'feed,
            };
            match stepped {
                Ok(StepOutcome::Output(chunk, s, tail)) => {
                    cur_scope = s;
                    pull = tail;
                    pending.extend(chunk.iter().cloned());
                }
                _ => break,
            }
        }
        for worker in workers {
            worker.join().await;
        }
        slots_for_feeder.close();
    }));
    (slots, feeder)
}

/// Like [`par_eval_map`], but forwards results in whichever order they finish rather than
/// input order — higher throughput when result order doesn't matter (§4.7).
pub fn par_eval_map_unordered<I, O, F, Fut>(source: Stream<I>, max_concurrent: usize, f: F) -> Stream<O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    Stream::from_pull(Box::new(UnorderedFeederNode {
        state: UnorderedFeederState::NotStarted(source.into_pull(), max_concurrent.max(1), f),
    }))
}

enum UnorderedFeederState<I, O, F> {
    NotStarted(BoxPull<I>, usize, F),
    Running(Outbox<O>),
}

struct UnorderedFeederNode<I, O, F> {
    state: UnorderedFeederState<I, O, F>,
}

impl<I, O, F, Fut> PullTrait<O> for UnorderedFeederNode<I, O, F>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    fn step(self: Box<Self>, scope: Scope) -> BoxFuture<'static, StreamResult<StepOutcome<O>>> {
        Box::pin(async move {
            let outbox = match self.state {
                UnorderedFeederState::Running(outbox) => outbox,
                UnorderedFeederState::NotStarted(source, max_concurrent, f) => {
                    let (outbox, feeder) =
                        spawn_par_eval_map_unordered_feeder(scope.clone(), source, max_concurrent, f);
                    register_teardown_finalizer(&scope, feeder, None)?;
                    outbox
                }
            };
            match outbox.take().await {
                None => Ok(StepOutcome::Done(scope)),
                Some(Ok(chunk)) => Ok(StepOutcome::Output(
                    chunk,
                    scope,
                    Box::new(UnorderedFeederNode { state: UnorderedFeederState::Running(outbox) }),
                )),
                Some(Err(e)) => Err(e),
            }
        })
    }
}

/// Like [`spawn_par_eval_map_feeder`] but order-agnostic: each worker offers its result
/// straight into the shared `outbox` as soon as `f` finishes, rather than through an
/// ordered slot. Still shares one `kill: Deferred<StreamError>` across every worker and
/// the feed loop, so the first worker to fail stops further admission and every other
/// in-flight worker exits without offering a result (the failure itself is offered into
/// `outbox` once, by whichever worker first observed it). Returns the feeder's own fiber
/// for early teardown.
fn spawn_par_eval_map_unordered_feeder<I, O, F, Fut>(
    scope: Scope,
    source: BoxPull<I>,
    max_concurrent: usize,
    mut f: F,
) -> (Outbox<O>, Fiber)
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StreamResult<O>> + Send + 'static,
{
    let outbox: Outbox<O> = Arc::new(BoundedQueue::bounded(max_concurrent.max(1)));
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let outbox_for_feeder = outbox.clone();
    let kill: Deferred<StreamError> = Deferred::new();
    let feeder = scope.runtime().spawn(Box::pin(async move {
        let mut pull = source;
        let mut cur_scope = scope.clone();
        let mut workers = Vec::new();
        'feed: loop {
            let stepped = tokio::select! {
                res = pull.step(cur_scope.clone()) => res,
                _ = kill.get() => break 'feed,
            };
            match stepped {
                Ok(StepOutcome::Output(chunk, s, tail)) => {
                    cur_scope = s;
                    pull = tail;
                    for item in chunk.iter().cloned() {
                        let permit = tokio::select! {
                            p = semaphore.clone().acquire_owned() => match p {
                                Ok(p) => p,
                                Err(_) => break 'feed,
                            },
                            _ = kill.get() => break 'feed,
                        };
                        let fut = f(item);
                        let outbox = outbox_for_feeder.clone();
                        let kill_for_worker = kill.clone();
                        workers.push(scope.runtime().spawn(Box::pin(async move {
                            let _permit = permit;
                            tokio::select! {
                                result = fut => {
                                    match result {
                                        Ok(value) => {
                                            let _ = outbox.offer(Ok(Chunk::single(value))).await;
                                        }
                                        Err(e) => {
                                            if kill_for_worker.complete(e.clone()).is_ok() {
                                                let _ = outbox.offer(Err(e)).await;
                                            }
                                        }
                                    }
                                }
                                _ = kill_for_worker.get() => {}
                            }
                        })));
                    }
                }
                _ => break,
            }
        }
        for worker in workers {
            worker.join().await;
        }
        outbox_for_feeder.close();
    }));
    (outbox, feeder)
}
