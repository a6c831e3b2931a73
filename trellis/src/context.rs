//! Request context: identity, deadline, cancellation and metadata.

use crate::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Carried alongside every request passed to an [`Endpoint`](crate::Endpoint).
///
/// Cloning a `Context` shares its cancellation token: cancelling any clone
/// cancels them all. Use [`Context::child`] to derive a context that can be
/// cancelled on its own but still observes cancellation of its parent.
#[derive(Debug, Clone)]
pub struct Context {
    request_id: u64,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    metadata: Arc<HashMap<String, String>>,
}

impl Context {
    /// A fresh context without deadline or metadata.
    pub fn new() -> Self {
        Self {
            request_id: next_request_id(),
            deadline: None,
            cancel: CancellationToken::new(),
            metadata: Arc::default(),
        }
    }

    /// A fresh context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    /// A fresh context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new().deadline(deadline)
    }

    fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a metadata entry, e.g. an `authorization` header value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.metadata).insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` without a deadline, zero once it passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the context is done, or `None` if it is still live.
    /// Cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            Some(Error::ContextCanceled)
        } else if self.is_expired() {
            Some(Error::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Derive a context sharing deadline and metadata with its own cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id,
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            metadata: Arc::clone(&self.metadata),
        }
    }

    /// Like [`Context::child`], with the deadline tightened to `deadline` if it is earlier.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        child
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Error::ContextCanceled,
                    _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                Error::ContextCanceled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
