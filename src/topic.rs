//! `Topic` and `Signal` — the public convenience wrappers over the concurrency
//! primitives (§4.5, §6 constructors `Topic.make(initial)` / `Signal.of(initial)`).
//!
//! `Topic` gives each subscriber its own bounded queue (capacity chosen at subscribe
//! time) so a slow subscriber only backpressures the publisher once *every* queue is
//! full, unlike `broadcast`'s lockstep delivery in `pubsub.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::queue::BoundedQueue;
use crate::token::Token;

struct Subscriber<T> {
    queue: Arc<BoundedQueue<T>>,
}

struct TopicState<T> {
    subscribers: HashMap<Token, Subscriber<T>>,
}

/// A multi-subscriber broadcast channel with a replayed initial value.
pub struct Topic<T: Clone + Send + 'static> {
    initial: T,
    state: Mutex<TopicState<T>>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// Creates a topic. `initial` is delivered first to every subscriber, mirroring
    /// `Topic.make(initial)`'s replay-one-value-on-subscribe behavior (S5).
    pub fn make(initial: T) -> Arc<Self> {
        Arc::new(Topic { initial, state: Mutex::new(TopicState { subscribers: HashMap::new() }) })
    }

    /// Publishes a value to every current subscriber's queue, waiting for capacity on
    /// whichever queue is currently fullest.
    pub async fn publish(&self, value: T) -> Result<(), StreamError> {
        let queues: Vec<_> = {
            let state = self.state.lock();
            state.subscribers.values().map(|s| s.queue.clone()).collect()
        };
        for queue in queues {
            queue.offer(value.clone()).await?;
        }
        Ok(())
    }

    /// Registers a new subscriber with its own `capacity`-bounded queue, seeded with the
    /// topic's initial value.
    pub async fn subscribe(self: &Arc<Self>, capacity: usize) -> TopicSubscription<T> {
        let queue = Arc::new(BoundedQueue::bounded(capacity.max(1)));
        queue.offer(self.initial.clone()).await.ok();
        let token = Token::new();
        self.state.lock().subscribers.insert(token, Subscriber { queue: queue.clone() });
        TopicSubscription { topic: self.clone(), token, queue }
    }

    fn unsubscribe(&self, token: Token) {
        if let Some(sub) = self.state.lock().subscribers.remove(&token) {
            sub.queue.close();
        }
    }
}

/// A live subscription; dropping it unregisters the subscriber from the topic.
pub struct TopicSubscription<T: Clone + Send + 'static> {
    topic: Arc<Topic<T>>,
    token: Token,
    queue: Arc<BoundedQueue<T>>,
}

impl<T: Clone + Send + 'static> TopicSubscription<T> {
    /// Pulls the next value, or `None` once the subscription has been closed.
    pub async fn next(&self) -> Option<T> {
        self.queue.take().await
    }
}

impl<T: Clone + Send + 'static> Drop for TopicSubscription<T> {
    fn drop(&mut self) {
        self.topic.unsubscribe(self.token);
    }
}

/// A single-slot, always-has-a-value cell with change notification — the minimal
/// `Signal.of(initial)` primitive used to build `interruptWhen`'s halt signal and
/// similar "latest value" wiring.
pub struct Signal<T: Clone + Send + Sync + 'static> {
    tx: tokio::sync::watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    pub fn of(initial: T) -> Arc<Self> {
        let (tx, _rx) = tokio::sync::watch::channel(initial);
        Arc::new(Signal { tx })
    }

    /// Replaces the current value, waking anyone awaiting a change.
    pub fn set(&self, value: T) {
        // A closed receiver set (every subscription dropped) is not an error here: a
        // signal with no observers still holds a current value.
        let _ = self.tx.send(value);
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Waits until the value changes from whatever it was at call time, then returns
    /// the new one.
    pub async fn changes(&self) -> T {
        let mut rx = self.tx.subscribe();
        match rx.changed().await {
            Ok(()) => rx.borrow().clone(),
            Err(_) => self.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_initial_then_published_values_in_order() {
        let topic = Topic::make(-1);
        let sub = topic.subscribe(8).await;
        topic.publish(0).await.unwrap();
        topic.publish(1).await.unwrap();
        assert_eq!(sub.next().await, Some(-1));
        assert_eq!(sub.next().await, Some(0));
        assert_eq!(sub.next().await, Some(1));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_full_sequence() {
        let topic = Topic::make(0);
        let a = topic.subscribe(16).await;
        let b = topic.subscribe(16).await;
        for i in 1..=3 {
            topic.publish(i).await.unwrap();
        }
        let mut seen_a = Vec::new();
        for _ in 0..4 {
            seen_a.push(a.next().await.unwrap());
        }
        let mut seen_b = Vec::new();
        for _ in 0..4 {
            seen_b.push(b.next().await.unwrap());
        }
        assert_eq!(seen_a, vec![0, 1, 2, 3]);
        assert_eq!(seen_b, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn dropping_subscription_stops_backpressuring_publisher() {
        let topic = Topic::make(0);
        let sub = topic.subscribe(1).await;
        drop(sub);
        topic.publish(1).await.unwrap();
        topic.publish(2).await.unwrap();
    }

    #[tokio::test]
    async fn signal_reports_latest_and_notifies_changes() {
        let signal = Signal::of(0);
        assert_eq!(signal.get(), 0);
        let s2 = signal.clone();
        let waiter = tokio::spawn(async move { s2.changes().await });
        tokio::task::yield_now().await;
        signal.set(42);
        assert_eq!(waiter.await.unwrap(), 42);
        assert_eq!(signal.get(), 42);
    }
}
