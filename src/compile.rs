//! The compile surface (§8's `s.compile.{ drain, toList, toVector, fold, foldChunks,
//! last, lastOrError, count, string }`): turns a `Stream<O>` into a single `F<A>` by
//! building a root `Scope` and driving the Pull program step by step, the same
//! own-a-root-state/run-one-step/tear-down shape a driver loop takes for any one-shot
//! interpreter, specialised here to "open a root scope, loop `step` to exhaustion, close
//! the scope".

use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::error::{ExitCase, StreamError, StreamResult};
use crate::pull::StepOutcome;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::scope::Scope;
use crate::Stream;

/// Compiles streams against a fixed [`RuntimeConfig`]. Cheap to keep around (an `Arc`
/// runtime handle plus a lock guarding the one extended top-level scope a given
/// `Compiler` may have open at a time — see Open Question decision 2 in DESIGN.md);
/// [`run()`] builds the ambient default for one-off use.
pub struct Compiler {
    runtime: Arc<dyn Runtime>,
    extended_top_level: Mutex<Option<Scope>>,
}

impl Compiler {
    /// Compiles against the ambient `tokio` runtime, captured on the spot.
    pub fn new() -> Self {
        Compiler::with_config(RuntimeConfig::new())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Compiler { runtime: config.runtime, extended_top_level: Mutex::new(None) }
    }

    /// Closes whatever extended top-level scope this compiler still has open, then opens
    /// a fresh one. At most one is ever open at a time (Open Question decision 2): a
    /// compiler that's driven a stream to completion has already closed its own scope by
    /// the time this runs again, so in practice this only ever finds `None` here — it
    /// exists so a future caller holding a `Stream` across an unfinished compile (e.g. one
    /// abandoned by a panic unwind) can't leak two live root scopes off the same compiler.
    async fn root_scope(&self) -> Scope {
        let previous = self.extended_top_level.lock().take();
        if let Some(prev) = previous {
            let _ = prev.close(ExitCase::Succeeded).await;
        }
        let scope = Scope::root(self.runtime.clone());
        *self.extended_top_level.lock() = Some(scope.clone());
        scope
    }

    fn clear_extended(&self, scope: &Scope) {
        let mut slot = self.extended_top_level.lock();
        if slot.as_ref().map(|s| s == scope).unwrap_or(false) {
            *slot = None;
        }
    }

    /// Drives `stream` to exhaustion, folding each chunk into `acc` with `f`. The core
    /// driver every other compile operation is built from.
    pub async fn fold_chunks<O, Z, F>(&self, stream: Stream<O>, init: Z, mut f: F) -> StreamResult<Z>
    where
        O: Send + 'static,
        Z: Send + 'static,
        F: FnMut(Z, Chunk<O>) -> Z + Send + 'static,
    {
        let scope = self.root_scope().await;
        let mut pull = stream.into_pull();
        let mut cur_scope = scope.clone();
        let mut acc = init;
        let outcome = loop {
            match pull.step(cur_scope.clone()).await {
                Ok(StepOutcome::Output(chunk, next_scope, tail)) => {
                    cur_scope = next_scope;
                    pull = tail;
                    acc = f(acc, chunk);
                }
                Ok(StepOutcome::Done(_)) => break Ok(acc),
                Ok(StepOutcome::Interrupted(_, err)) => match err {
                    Some(e) => break Err(e),
                    None => break Ok(acc),
                },
                Err(e) => break Err(e),
            }
        };
        let exit = match &outcome {
            Ok(_) => ExitCase::Succeeded,
            Err(e) => ExitCase::Failed(e.clone()),
        };
        let close_result = scope.close(exit).await;
        self.clear_extended(&scope);
        match (outcome, close_result) {
            (Ok(acc), Ok(())) => Ok(acc),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(run_err), _) => Err(run_err),
        }
    }

    /// Folds element-by-element rather than chunk-by-chunk.
    pub async fn fold<O, Z, F>(&self, stream: Stream<O>, init: Z, mut f: F) -> StreamResult<Z>
    where
        O: Clone + Send + 'static,
        Z: Send + 'static,
        F: FnMut(Z, O) -> Z + Send + 'static,
    {
        self.fold_chunks(stream, init, move |acc, chunk| {
            chunk.iter().fold(acc, |acc, o| f(acc, clone_ref(o)))
        })
        .await
    }

    /// Runs `stream` purely for its effects, discarding every emitted element.
    pub async fn drain<O: Send + 'static>(&self, stream: Stream<O>) -> StreamResult<()> {
        self.fold_chunks(stream, (), |_, _chunk| ()).await
    }

    /// Collects every element into a `Vec`, in order.
    pub async fn to_list<O>(&self, stream: Stream<O>) -> StreamResult<Vec<O>>
    where
        O: Clone + Send + 'static,
    {
        self.fold_chunks(stream, Vec::new(), |mut acc, chunk| {
            acc.extend(chunk.to_vec());
            acc
        })
        .await
    }

    /// Same as [`to_list`](Self::to_list): this crate has no distinct persistent-vector
    /// type the way the source distinguishes `List` from `Vector`, so both compile
    /// targets land on `Vec`.
    pub async fn to_vector<O>(&self, stream: Stream<O>) -> StreamResult<Vec<O>>
    where
        O: Clone + Send + 'static,
    {
        self.to_list(stream).await
    }

    /// The last element emitted, or `None` if the stream emitted nothing.
    pub async fn last<O>(&self, stream: Stream<O>) -> StreamResult<Option<O>>
    where
        O: Clone + Send + 'static,
    {
        self.fold(stream, None, |_, o| Some(o)).await
    }

    /// The last element emitted, failing if the stream emitted nothing at all.
    pub async fn last_or_error<O>(&self, stream: Stream<O>) -> StreamResult<O>
    where
        O: Clone + Send + 'static,
    {
        match self.last(stream).await? {
            Some(o) => Ok(o),
            None => Err(StreamError::msg("lastOrError: stream emitted no elements")),
        }
    }

    /// Number of elements emitted.
    pub async fn count<O: Send + 'static>(&self, stream: Stream<O>) -> StreamResult<usize> {
        self.fold_chunks(stream, 0usize, |acc, chunk| acc + chunk.len()).await
    }

    /// Concatenates every `String`-flavoured element emitted. Mirrors the source's
    /// `compile.string`, which concatenates a `Stream[F, String]`; generalised here over
    /// anything cheaply viewable as `&str` rather than requiring `O = String` exactly.
    pub async fn string<O>(&self, stream: Stream<O>) -> StreamResult<String>
    where
        O: AsRef<str> + Clone + Send + 'static,
    {
        self.fold(stream, String::new(), |mut acc, o| {
            acc.push_str(o.as_ref());
            acc
        })
        .await
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}

fn clone_ref<O: Clone>(o: &O) -> O {
    o.clone()
}

/// One-shot convenience: builds a default [`Compiler`] and drains `stream` for its
/// effects. Most callers that only need a single compile in the lifetime of the ambient
/// runtime reach for this instead of constructing a `Compiler` themselves.
pub async fn drain<O: Send + 'static>(stream: Stream<O>) -> StreamResult<()> {
    Compiler::new().drain(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructors::{emits, raise_error};
    use crate::error::StreamError;

    #[tokio::test]
    async fn to_list_preserves_order() {
        let compiler = Compiler::new();
        let result = compiler.to_list(emits(vec![1, 2, 3])).await.unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn count_matches_length() {
        let compiler = Compiler::new();
        let result = compiler.count(emits(0..100)).await.unwrap();
        assert_eq!(result, 100);
    }

    #[tokio::test]
    async fn last_or_error_fails_on_empty() {
        let compiler = Compiler::new();
        let err = compiler.last_or_error(emits(Vec::<i32>::new())).await.unwrap_err();
        assert!(matches!(err, StreamError::User(_)));
    }

    #[tokio::test]
    async fn drain_propagates_failure() {
        let compiler = Compiler::new();
        let err = compiler
            .drain(emits(vec![1, 2]).append(raise_error(StreamError::msg("boom"))))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::User(_)));
    }

    #[tokio::test]
    async fn fold_sums_elements() {
        let compiler = Compiler::new();
        let total = compiler.fold(emits(1..=5), 0, |acc, x| acc + x).await.unwrap();
        assert_eq!(total, 15);
    }
}
