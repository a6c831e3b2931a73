//! Defines the push-based discovery contract [`Instancer`] and the
//! reusable [`Broadcaster`] that discovery adapters build on.

use crate::{Event, EventSender};
use parking_lot::Mutex;

/// A source of discovery [`Event`]s for one remote service.
///
/// `register` must deliver the current state to the new subscriber before
/// returning. After `deregister` no further events are sent to that sender.
pub trait Instancer: Send + Sync {
    fn register(&self, tx: EventSender);

    fn deregister(&self, tx: &EventSender);
}

impl<T: Instancer + ?Sized> Instancer for std::sync::Arc<T> {
    fn register(&self, tx: EventSender) {
        (**self).register(tx)
    }

    fn deregister(&self, tx: &EventSender) {
        (**self).deregister(tx)
    }
}

/// Holds the current discovery state and fans every change out to subscribers.
///
/// Delivery to each subscriber goes through its own single-slot channel, so a
/// slow subscriber never holds up the others and always ends up with the
/// latest state.
#[derive(Debug, Default)]
pub struct Broadcaster {
    inner: Mutex<BroadcasterState>,
}

#[derive(Debug, Default)]
struct BroadcasterState {
    state: Event,
    subscribers: Vec<EventSender>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current state and broadcast it.
    ///
    /// Instances are sorted first; an event identical to the current state is dropped.
    pub fn update(&self, mut event: Event) {
        event.instances.sort();
        let mut inner = self.inner.lock();
        if inner.state.same_state(&event) {
            return;
        }
        match &event.err {
            None => tracing::debug!(instances = ?event.instances, "discovery state changed"),
            Some(err) => tracing::warn!(error = %err, "discovery reported an error"),
        }
        inner.state = event;
        let BroadcasterState { state, subscribers } = &mut *inner;
        subscribers.retain(|tx| tx.send(state.clone()));
    }

    /// The current state.
    pub fn state(&self) -> Event {
        self.inner.lock().state.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl Instancer for Broadcaster {
    fn register(&self, tx: EventSender) {
        let mut inner = self.inner.lock();
        if tx.send(inner.state.clone()) {
            inner.subscribers.push(tx);
        }
    }

    fn deregister(&self, tx: &EventSender) {
        self.inner.lock().subscribers.retain(|s| s != tx);
    }
}

/// An [`Instancer`] whose instance list never changes.
#[derive(Debug, Clone)]
pub struct FixedInstancer {
    instances: Vec<String>,
}

impl FixedInstancer {
    pub fn new<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instances: instances.into_iter().map(Into::into).collect(),
        }
    }
}

impl Instancer for FixedInstancer {
    fn register(&self, tx: EventSender) {
        tx.send(Event::healthy(self.instances.iter().cloned()));
    }

    fn deregister(&self, _tx: &EventSender) {}
}
