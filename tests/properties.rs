//! Property-style integration tests against the compile surface: each test exercises
//! one invariant end to end rather than probing a single node in isolation.

use std::sync::Arc;

use parking_lot::Mutex;

use brookcore::compile::Compiler;
use brookcore::concurrent::{interrupt_when, par_join};
use brookcore::constructors::{bracket, emits, raise_error, unfold_eval};
use brookcore::error::StreamError;
use brookcore::topic::Signal;
use brookcore::Stream;

fn labeled_bracket(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Stream<Arc<()>> {
    let acq_log = log.clone();
    let rel_log = log.clone();
    bracket(
        async move {
            acq_log.lock().push(format!("acq {label}"));
            Ok(())
        },
        move |_r| {
            let rel_log = rel_log.clone();
            async move {
                rel_log.lock().push(format!("rel {label}"));
                Ok(())
            }
        },
    )
}

/// P1: `map(identity)` changes nothing.
#[tokio::test]
async fn p1_map_identity_is_noop() {
    let compiler = Compiler::new();
    let result = compiler.to_list(emits(vec![1, 2, 3]).map(|x| *x)).await.unwrap();
    assert_eq!(result, vec![1, 2, 3]);
}

/// P2: `(a ++ b) ++ c` and `a ++ (b ++ c)` compile to the same concatenation.
#[tokio::test]
async fn p2_append_is_associative() {
    let compiler = Compiler::new();
    let a = || emits(vec![1, 2]);
    let b = || emits(vec![3, 4]);
    let c = || emits(vec![5, 6]);

    let left = a().append(b()).append(c());
    let right = a().append(b().append(c()));

    let left_result = compiler.to_list(left).await.unwrap();
    let right_result = compiler.to_list(right).await.unwrap();
    assert_eq!(left_result, right_result);
    assert_eq!(left_result, vec![1, 2, 3, 4, 5, 6]);
}

/// P3: `flat_map(|x| emit(f(x)))` is equivalent to `map(f)`.
#[tokio::test]
async fn p3_flat_map_of_single_emit_equals_map() {
    let compiler = Compiler::new();
    let mapped = compiler.to_list(emits(1..=5).map(|x| x * 10)).await.unwrap();
    let flat_mapped = compiler
        .to_list(emits(1..=5).flat_map(|x| brookcore::constructors::emit(x * 10)))
        .await
        .unwrap();
    assert_eq!(mapped, flat_mapped);
}

/// P4: chunking then unchunking round-trips every element in order.
#[tokio::test]
async fn p4_chunks_then_unchunk_round_trips() {
    let compiler = Compiler::new();
    let original: Vec<i32> = (0..37).collect();
    let round_tripped = compiler
        .to_list(emits(original.clone()).chunk_n(8, true).chunks().unchunk())
        .await
        .unwrap();
    assert_eq!(round_tripped, original);
}

/// P5: `take(k)` on a stream with at least `k` elements yields exactly the first `k`.
#[tokio::test]
async fn p5_take_truncates_to_first_k() {
    let compiler = Compiler::new();
    let result = compiler.to_list(emits(0..100).take(7)).await.unwrap();
    assert_eq!(result, vec![0, 1, 2, 3, 4, 5, 6]);
}

/// P6: nested brackets release in strict LIFO order, regardless of how the innermost
/// stream ends (success, failure, or early termination all still unwind the same way).
#[tokio::test]
async fn p6_nested_brackets_release_lifo_on_success() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stream = labeled_bracket("a", log.clone())
        .flat_map({
            let log = log.clone();
            move |_| labeled_bracket("b", log.clone()).flat_map({
                let log = log.clone();
                move |_| labeled_bracket("c", log.clone()).map(|_| 1)
            })
        });
    Compiler::new().drain(stream).await.unwrap();
    assert_eq!(
        *log.lock(),
        vec!["acq a", "acq b", "acq c", "rel c", "rel b", "rel a"]
    );
}

#[tokio::test]
async fn p6_nested_brackets_release_lifo_on_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stream: Stream<i32> = labeled_bracket("a", log.clone()).flat_map({
        let log = log.clone();
        move |_| {
            labeled_bracket("b", log.clone())
                .flat_map(|_| raise_error(StreamError::msg("boom")))
        }
    });
    let err = Compiler::new().drain(stream).await.unwrap_err();
    assert!(matches!(err, StreamError::User(_)));
    assert_eq!(*log.lock(), vec!["acq a", "acq b", "rel b", "rel a"]);
}

/// P7: a bracketed resource is released exactly once even when the downstream consumer
/// stops pulling early via `take`.
#[tokio::test]
async fn p7_bracket_releases_once_under_early_termination() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stream = labeled_bracket("res", log.clone()).flat_map(|_| brookcore::constructors::constant(1)).take(5);
    let result = Compiler::new().to_list(stream).await.unwrap();
    assert_eq!(result, vec![1, 1, 1, 1, 1]);
    assert_eq!(*log.lock(), vec!["acq res", "rel res"]);
}

/// P8: `handle_error_with` masks a failure, letting the recovery stream's elements
/// through in its place.
#[tokio::test]
async fn p8_handle_error_with_masks_failure() {
    let compiler = Compiler::new();
    let stream = emits(vec![1, 2])
        .append(raise_error(StreamError::msg("boom")))
        .handle_error_with(|_e| emits(vec![99]));
    let result = compiler.to_list(stream).await.unwrap();
    assert_eq!(result, vec![1, 2, 99]);
}

/// P9: `translate` onto the same runtime the stream already runs against changes
/// nothing observable.
#[tokio::test]
async fn p9_translate_onto_same_runtime_is_identity() {
    let compiler = Compiler::new();
    let runtime: Arc<dyn brookcore::Runtime> = Arc::new(brookcore::runtime::TokioRuntime::current());
    let result = compiler
        .to_list(emits(vec![1, 2, 3]).translate(runtime))
        .await
        .unwrap();
    assert_eq!(result, vec![1, 2, 3]);
}

/// P10: `par_join` over disjoint sources is consistent with the union of what each
/// source would have produced alone, just interleaved.
#[tokio::test]
async fn p10_par_join_is_merge_consistent() {
    let compiler = Compiler::new();
    let s1 = emits(1..=100);
    let s2 = emits(101..=200);
    let joined = par_join(2, vec![s1, s2]);
    let mut result = compiler.to_list(joined).await.unwrap();
    result.sort_unstable();
    let expected: Vec<i64> = (1..=200).collect();
    assert_eq!(result, expected);
}

/// P11: concurrently joined inner streams finalize before the scope wrapping the whole
/// `par_join` call closes.
#[tokio::test]
async fn p11_par_join_inner_finalizers_run_before_outer() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner1 = labeled_bracket("inner1", log.clone()).map(|_| 1);
    let inner2 = labeled_bracket("inner2", log.clone()).map(|_| 2);
    let mut joined = Some(par_join(2, vec![inner1, inner2]));

    let stream = labeled_bracket("outer", log.clone())
        .flat_map(move |_| joined.take().expect("flat_map called once"))
        .scope();
    Compiler::new().drain(stream).await.unwrap();

    let events = log.lock().clone();
    let outer_pos = events.iter().position(|e| e == "rel outer").unwrap();
    let inner1_pos = events.iter().position(|e| e == "rel inner1").unwrap();
    let inner2_pos = events.iter().position(|e| e == "rel inner2").unwrap();
    assert!(inner1_pos < outer_pos, "events: {events:?}");
    assert!(inner2_pos < outer_pos, "events: {events:?}");
}

/// An erroring `par_join` lane cancels its sibling lanes (the first error wins and the
/// scope subtree tears down) rather than letting them run untouched to completion.
#[tokio::test]
async fn p_par_join_error_cancels_sibling_lanes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let failing = raise_error::<i64>(StreamError::msg("boom"));
    let slow = labeled_bracket("slow", log.clone()).flat_map(|_| {
        unfold_eval(0i64, |n| async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(Some((n, n + 1)))
        })
    });

    let result = Compiler::new().to_list(par_join(2, vec![failing, slow])).await;
    assert!(result.is_err());

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let events = log.lock().clone();
    assert!(events.contains(&"rel slow".to_string()), "events: {events:?}");
}

/// P12: `broadcast_through` delivers every element to every subscriber, in order.
#[tokio::test]
async fn p12_broadcast_through_fans_out_to_every_subscriber() {
    use brookcore::concurrent::broadcast_through;

    let compiler = Compiler::new();
    let pipes: Vec<_> = (0..4)
        .map(|id| {
            Box::new(move |s: Stream<i32>| s.map(move |x| (id, *x))) as Box<dyn FnOnce(Stream<i32>) -> Stream<(usize, i32)> + Send>
        })
        .collect();
    let stream = broadcast_through(emits(vec![1, 2, 3]), pipes);
    let mut result = compiler.to_list(stream).await.unwrap();
    result.sort_unstable();

    let mut expected = Vec::new();
    for id in 0..4 {
        for x in [1, 2, 3] {
            expected.push((id, x));
        }
    }
    expected.sort_unstable();
    assert_eq!(result, expected);
}

/// `broadcast` hands back one independent subscription per requested pipe slot, each
/// seeing every element of the source. `Stream<Stream<O>>` can't go through `to_list`
/// (`Stream<O>` is never `Clone`), so its single emitted chunk is unpacked via
/// `Chunk::into_vec` inside `fold_chunks`, which carries no such bound. Subscriptions
/// publish in lockstep, so they're drained concurrently here rather than one at a time.
#[tokio::test]
async fn broadcast_hands_back_one_subscription_per_pipe() {
    use brookcore::concurrent::broadcast;

    let subs = Compiler::new()
        .fold_chunks(broadcast(emits(vec![1, 2, 3]), 3), Vec::new(), |_, chunk| {
            chunk.into_vec().ok().expect("broadcast's chunk is freshly built and uniquely owned")
        })
        .await
        .unwrap();
    assert_eq!(subs.len(), 3);

    let handles: Vec<_> =
        subs.into_iter().map(|sub| tokio::spawn(async move { Compiler::new().to_list(sub).await.unwrap() })).collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), vec![1, 2, 3]);
    }
}

/// P13: `interrupt_when` bounds an otherwise-infinite stream to a finite run once the
/// signal flips, and releases whatever it held.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn p13_interrupt_when_bounds_an_infinite_stream() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let signal = Signal::of(false);
    {
        let signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            signal.set(true);
        });
    }

    let stream = labeled_bracket("held", log.clone())
        .flat_map(|_| brookcore::constructors::repeat_eval(|| async { Ok::<i32, StreamError>(1) }));
    let interrupted = interrupt_when(stream, signal);

    let start = std::time::Instant::now();
    let count = Compiler::new().count(interrupted).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed < std::time::Duration::from_secs(2), "took {elapsed:?}");
    assert!(count > 0);
    assert_eq!(*log.lock(), vec!["acq held", "rel held"]);
}
