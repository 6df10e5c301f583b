//! `PubSub[I,O,State,Selector]` — the generalized broker behind `broadcast` (§4.5, §4.7).
//!
//! A [`Strategy`] owns the admission policy (`accepts`/`publish`) and the delivery policy
//! (`subscribe`/`get`/`unsubscribe`); `PubSub` just wires a `Strategy`'s `State` behind a
//! mutex and wakes parked publishers/subscribers whenever that state changes, mutating
//! under lock then notifying as one atomic step.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// The admission and delivery policy a [`PubSub`] is parameterised by.
pub trait Strategy: Send + Sync + 'static {
    type Input: Send;
    type Output: Send;
    type State: Send;
    type Selector: Clone + Eq + Send;

    fn initial(&self) -> Self::State;
    /// Whether `input` can be published against `state` right now (publishers park
    /// while this is false).
    fn accepts(&self, input: &Self::Input, state: &Self::State) -> bool;
    /// Folds `input` into `state`. Only called after `accepts` returned true.
    fn publish(&self, input: Self::Input, state: &mut Self::State);
    /// What `selector` currently sees, if anything (subscribers park while this is
    /// `None`).
    fn get(&self, selector: &Self::Selector, state: &Self::State) -> Option<Self::Output>;
    fn subscribe(&self, state: &mut Self::State) -> Self::Selector;
    fn unsubscribe(&self, selector: &Self::Selector, state: &mut Self::State);
}

/// A running broker over `S`.
pub struct PubSub<S: Strategy> {
    strategy: S,
    state: Mutex<S::State>,
    changed: Notify,
}

impl<S: Strategy> PubSub<S> {
    pub fn new(strategy: S) -> Self {
        let state = Mutex::new(strategy.initial());
        PubSub { strategy, state, changed: Notify::new() }
    }

    /// Publishes `input`, parking until the strategy accepts it.
    pub async fn publish(&self, input: S::Input) {
        let mut input = Some(input);
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.state.lock();
                if self.strategy.accepts(input.as_ref().unwrap(), &state) {
                    self.strategy.publish(input.take().unwrap(), &mut state);
                    drop(state);
                    self.changed.notify_waiters();
                    return;
                }
            }
            changed.await;
        }
    }

    /// Registers a new subscriber, returning its selector.
    pub fn subscribe(&self) -> S::Selector {
        let mut state = self.state.lock();
        let selector = self.strategy.subscribe(&mut state);
        drop(state);
        self.changed.notify_waiters();
        selector
    }

    /// Deregisters `selector`. Unparks any publisher that was waiting on this
    /// subscriber's consumption.
    pub fn unsubscribe(&self, selector: &S::Selector) {
        let mut state = self.state.lock();
        self.strategy.unsubscribe(selector, &mut state);
        drop(state);
        self.changed.notify_waiters();
    }

    /// Waits for `selector` to see its next output.
    pub async fn get(&self, selector: &S::Selector) -> S::Output {
        loop {
            let changed = self.changed.notified();
            {
                let state = self.state.lock();
                if let Some(out) = self.strategy.get(selector, &state) {
                    drop(state);
                    self.changed.notify_waiters();
                    return out;
                }
            }
            changed.await;
        }
    }
}

/// The `Broadcast` strategy (§4.5): every currently-subscribed selector must consume the
/// current chunk before the next one is accepted. `min_ready` implements `awaitSub(min)`:
/// the very first publish is held until at least that many subscribers are registered.
pub struct BroadcastStrategy<O> {
    min_ready: usize,
    _marker: std::marker::PhantomData<O>,
}

impl<O> BroadcastStrategy<O> {
    pub fn new(min_ready: usize) -> Self {
        BroadcastStrategy { min_ready, _marker: std::marker::PhantomData }
    }
}

pub struct BroadcastState<O: Clone> {
    subscribers: std::collections::HashMap<crate::token::Token, Option<O>>,
    started: bool,
}

impl<O: Clone + Send + 'static> Strategy for BroadcastStrategy<O> {
    type Input = O;
    type Output = O;
    type State = BroadcastState<O>;
    type Selector = crate::token::Token;

    fn initial(&self) -> Self::State {
        BroadcastState { subscribers: std::collections::HashMap::new(), started: false }
    }

    fn accepts(&self, _input: &O, state: &Self::State) -> bool {
        if !state.started && state.subscribers.len() < self.min_ready {
            return false;
        }
        state.subscribers.values().all(Option::is_none)
    }

    fn publish(&self, input: O, state: &mut Self::State) {
        state.started = true;
        for slot in state.subscribers.values_mut() {
            *slot = Some(input.clone());
        }
    }

    fn get(&self, selector: &Self::Selector, state: &Self::State) -> Option<O> {
        state.subscribers.get(selector).and_then(|slot| slot.clone())
    }

    fn subscribe(&self, state: &mut Self::State) -> Self::Selector {
        let token = crate::token::Token::new();
        state.subscribers.insert(token, None);
        token
    }

    fn unsubscribe(&self, selector: &Self::Selector, state: &mut Self::State) {
        state.subscribers.remove(selector);
    }
}

impl<S: Strategy> PubSub<S>
where
    S::Output: Clone,
{
    /// Takes the delivered value and clears the slot so the next publish can proceed,
    /// used by `Broadcast`-style strategies where `get` would otherwise keep returning
    /// the same value forever.
    pub async fn get_and_ack(&self, selector: &S::Selector) -> S::Output
    where
        S: Strategy<State = BroadcastState<<S as Strategy>::Output>, Selector = crate::token::Token>,
    {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.state.lock();
                if let Some(slot) = state.subscribers.get_mut(selector) {
                    if let Some(value) = slot.take() {
                        drop(state);
                        self.changed.notify_waiters();
                        return value;
                    }
                }
            }
            changed.await;
        }
    }
}

pub(crate) type Broadcast<O> = PubSub<BroadcastStrategy<O>>;

pub(crate) fn new_broadcast<O: Clone + Send + 'static>(min_ready: usize) -> Arc<Broadcast<O>> {
    Arc::new(PubSub::new(BroadcastStrategy::new(min_ready)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn every_subscriber_sees_every_published_value_in_order() {
        let pubsub = new_broadcast::<i32>(2);
        let s1 = pubsub.subscribe();
        let s2 = pubsub.subscribe();

        let pubsub_pub = pubsub.clone();
        let publisher = tokio::spawn(async move {
            for i in 0..5 {
                pubsub_pub.publish(i).await;
            }
        });

        let pubsub1 = pubsub.clone();
        let reader1 = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(pubsub1.get_and_ack(&s1).await);
            }
            seen
        });
        let pubsub2 = pubsub.clone();
        let reader2 = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(pubsub2.get_and_ack(&s2).await);
            }
            seen
        });

        publisher.await.unwrap();
        assert_eq!(reader1.await.unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(reader2.await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn publish_waits_for_min_ready_subscribers() {
        let pubsub = new_broadcast::<i32>(1);
        let pubsub2 = pubsub.clone();
        let publisher = tokio::spawn(async move {
            pubsub2.publish(1).await;
        });
        tokio::task::yield_now().await;
        assert!(!publisher.is_finished());
        let sel = pubsub.subscribe();
        publisher.await.unwrap();
        assert_eq!(pubsub.get_and_ack(&sel).await, 1);
    }
}
