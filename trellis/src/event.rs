//! Discovery [`Event`]s and the single-slot channel that carries them.

use crate::DiscoveryError;
use anyhow::anyhow;
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A snapshot of the live instances of a service, or a discovery failure.
///
/// When `err` is set the event is authoritative as a failure and `instances`
/// is disregarded, whatever it contains.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub instances: Vec<String>,
    pub err: Option<DiscoveryError>,
}

impl Event {
    /// A healthy event listing the full current set of instances.
    pub fn healthy<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instances: instances.into_iter().map(Into::into).collect(),
            err: None,
        }
    }

    pub fn error(err: impl Into<anyhow::Error>) -> Self {
        Self {
            instances: Vec::new(),
            err: Some(DiscoveryError::new(err)),
        }
    }

    /// Shorthand for an error event from a message.
    pub fn error_msg(msg: impl std::fmt::Display) -> Self {
        Self::error(anyhow!("{}", msg))
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    /// True if both events describe the same healthy state, or share the same failure.
    pub(crate) fn same_state(&self, other: &Self) -> bool {
        match (&self.err, &other.err) {
            (None, None) => self.instances == other.instances,
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

static SENDER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Create a subscription channel for an [`Instancer`](crate::Instancer).
///
/// The channel holds a single slot: sending never blocks, and a receiver that
/// falls behind observes only the most recent event. Events are full
/// snapshots, so skipping intermediate ones loses nothing.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = watch::channel(None);
    (
        EventSender {
            id: SENDER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            tx: Arc::new(tx),
        },
        EventReceiver { rx },
    )
}

/// Sending half of [`event_channel`]. Clones compare equal to the original.
#[derive(Debug, Clone)]
pub struct EventSender {
    id: u64,
    tx: Arc<watch::Sender<Option<Event>>>,
}

impl EventSender {
    /// Publish `event`, replacing any event the receiver has not seen yet.
    ///
    /// Returns false if the receiver is gone.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send_replace(Some(event));
        !self.tx.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl PartialEq for EventSender {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventSender {}

/// Receiving half of [`event_channel`]. Exactly one reader drains it.
#[derive(Debug)]
pub struct EventReceiver {
    rx: watch::Receiver<Option<Event>>,
}

impl EventReceiver {
    /// Wait for the next unseen event; `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    /// Take the pending event without waiting, if there is one.
    ///
    /// An unseen event is still returned after every sender has been dropped.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.changed().now_or_never() {
            Some(Ok(())) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }
}
