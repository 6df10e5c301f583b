//! End-to-end scenario tests straight out of SPEC_FULL.md's walkthrough section.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use brookcore::compile::Compiler;
use brookcore::concurrent::{interrupt_when, par_join, subscribe_stream};
use brookcore::constructors::{bracket, emits, range};
use brookcore::error::StreamError;
use brookcore::topic::{Signal, Topic};

/// S1: `emits([1,2,3]) ++ emits([4,5])` yields the elements of both in order.
#[tokio::test]
async fn s1_append_concatenates_in_order() {
    let stream = emits(vec![1, 2, 3]).append(emits(vec![4, 5]));
    let result = Compiler::new().to_list(stream).await.unwrap();
    assert_eq!(result, vec![1, 2, 3, 4, 5]);
}

/// S2: `range(0, 5).map(_ * 2)` yields the even numbers below 10.
#[tokio::test]
async fn s2_range_then_map_doubles_each_element() {
    let stream = range(0, 5).map(|n| n * 2);
    let result = Compiler::new().to_list(stream).await.unwrap();
    assert_eq!(result, vec![0, 2, 4, 6, 8]);
}

/// S3: a bracketed resource, nested under a failure that gets masked by
/// `handle_error_with`, still releases before the recovery stream's elements land.
#[tokio::test]
async fn s3_bracket_under_masked_failure_releases_before_recovery() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let acq_log = log.clone();
    let rel_log = log.clone();

    let stream = bracket(
        async move {
            acq_log.lock().push("acq A".to_string());
            Ok(())
        },
        move |_r| {
            let rel_log = rel_log.clone();
            async move {
                rel_log.lock().push("rel A".to_string());
                Ok(())
            }
        },
    )
    .flat_map(|_| emits(vec![1, 2]).append(brookcore::constructors::raise_error(StreamError::msg("boom"))))
    .handle_error_with(|_e| emits(vec![99]));

    let result = Compiler::new().to_list(stream).await.unwrap();
    assert_eq!(result, vec![1, 2, 99]);
    assert_eq!(*log.lock(), vec!["acq A", "rel A"]);
}

/// S4: `par_join(3)` over three disjoint 100-element sources yields exactly their union.
#[tokio::test]
async fn s4_par_join_three_way_union() {
    let s1 = emits(1..=100);
    let s2 = emits(101..=200);
    let s3 = emits(201..=300);
    let joined = par_join(3, vec![s1, s2, s3]);

    let mut result = Compiler::new().to_list(joined).await.unwrap();
    result.sort_unstable();
    let expected: Vec<i64> = (1..=300).collect();
    assert_eq!(result, expected);
}

/// S5: every `Topic` subscriber sees the replayed initial value, then every published
/// value, in order — regardless of when it subscribed relative to the others.
#[tokio::test]
async fn s5_topic_replays_initial_then_publishes_to_every_subscriber() {
    let topic = Topic::make(-1i32);

    let mut subs = Vec::new();
    for _ in 0..5 {
        subs.push(topic.subscribe(16).await);
    }

    let publisher = {
        let topic = topic.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for i in 0..10 {
                topic.publish(i).await.unwrap();
            }
        })
    };

    let mut handles = Vec::new();
    for sub in subs {
        handles.push(tokio::spawn(async move {
            let stream = subscribe_stream(sub).take(11);
            Compiler::new().to_list(stream).await
        }));
    }

    publisher.await.unwrap();

    let mut expected = vec![-1];
    expected.extend(0..10);
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, expected);
    }
}

/// S6: `interrupt_when` bounds an infinite stream to a finite compile, releasing
/// whatever resource it held along the way.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_interrupt_when_stops_an_infinite_stream_and_releases() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let acq_log = log.clone();
    let rel_log = log.clone();

    let signal = Signal::of(false);
    {
        let signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            signal.set(true);
        });
    }

    let stream = bracket(
        async move {
            acq_log.lock().push("acq held".to_string());
            Ok(())
        },
        move |_r| {
            let rel_log = rel_log.clone();
            async move {
                rel_log.lock().push("rel held".to_string());
                Ok(())
            }
        },
    )
    .flat_map(|_| brookcore::constructors::repeat_eval(|| async { Ok::<i32, StreamError>(1) }));

    let interrupted = interrupt_when(stream, signal);

    let start = std::time::Instant::now();
    let count = Compiler::new().count(interrupted).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(count > 0);
    assert_eq!(*log.lock(), vec!["acq held", "rel held"]);
}
