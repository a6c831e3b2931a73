//! Re-issues a request through a [`Balancer`] until it succeeds, attempts run
//! out or the retry deadline passes.

use crate::{Balancer, ConfigError, Context, Endpoint, Error, RetryError};
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

type Callback = dyn Fn(usize, &Error) -> (bool, Option<Error>) + Send + Sync;

/// Retry configuration bound to the balancer that selects each attempt's endpoint.
///
/// Every attempt asks the balancer for a fresh endpoint, so retries spread
/// over the instances instead of hammering the one that just failed. A
/// balancer that has no endpoints counts as a failed attempt.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use std::time::Duration;
/// use trellis::{Context, Endpoint, FixedEndpoints, Retry, RoundRobin};
///
/// let echo = Endpoint::new(|_ctx: Context, req: u32| async move { Ok::<_, trellis::Error>(req) });
/// let balancer = RoundRobin::new(FixedEndpoints::new(vec![echo]));
///
/// let endpoint = Retry::new(3, Duration::from_secs(1), balancer)
///     .expect("valid retry configuration")
///     .into_endpoint();
///
/// assert_eq!(endpoint.call(Context::new(), 7).await.unwrap(), 7);
/// # }
/// ```
///
/// Giving up has two error kinds. [`Error::RetryExhausted`] means every
/// attempt was used, [`Error::RetryDeadlineExceeded`] means the time budget
/// ran out first. Both carry a [`RetryError`] with the last attempt's error,
/// so callers that treat "retry gave up" as a single outcome must match both:
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use std::time::Duration;
/// use trellis::{Context, Endpoint, Error, FixedEndpoints, Retry, RoundRobin};
///
/// let broken = Endpoint::new(|_ctx: Context, _req: u32| async move {
///     Err::<u32, _>(Error::Transport(anyhow::anyhow!("connection refused")))
/// });
/// let endpoint = Retry::new(2, Duration::from_secs(1), RoundRobin::new(FixedEndpoints::new(vec![broken])))
///     .expect("valid retry configuration")
///     .into_endpoint();
///
/// match endpoint.call(Context::new(), 7).await {
///     Err(Error::RetryExhausted(retry)) | Err(Error::RetryDeadlineExceeded(retry)) => {
///         assert!(matches!(retry.last(), Some(Error::Transport(_))));
///     }
///     other => panic!("unexpected result: {:?}", other),
/// }
/// # }
/// ```
pub struct Retry<B> {
    max_attempts: usize,
    max_time: Duration,
    balancer: B,
    callback: Option<Arc<Callback>>,
}

impl<B> Retry<B> {
    /// Allow up to `max_attempts` attempts, all within `max_time` of the first one.
    pub fn new(max_attempts: usize, max_time: Duration, balancer: B) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            max_time,
            balancer,
            callback: None,
        })
    }

    /// Consulted after every failed attempt with the 1-based attempt number and its error.
    ///
    /// Returning `false` stops the loop: the caller receives the error itself,
    /// or the replacement if one is returned. A replacement returned alongside
    /// `true` is ignored.
    pub fn callback<F>(self, f: F) -> Self
    where
        F: Fn(usize, &Error) -> (bool, Option<Error>) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(f)),
            ..self
        }
    }

    pub fn into_endpoint<Req, Resp>(self) -> Endpoint<Req, Resp>
    where
        B: Balancer<Req, Resp> + 'static,
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let retry = Arc::new(self);
        Endpoint::new(move |ctx, req| Arc::clone(&retry).run(ctx, req))
    }

    async fn run<Req, Resp>(self: Arc<Self>, ctx: Context, req: Req) -> Result<Resp, Error>
    where
        B: Balancer<Req, Resp>,
        Req: Clone + Send,
        Resp: Send,
    {
        let loop_ctx = ctx.child_with_deadline(Instant::now() + self.max_time);
        let mut errors = Vec::new();

        for attempt in 1..=self.max_attempts {
            match loop_ctx.err() {
                Some(Error::ContextCanceled) => return Err(Error::ContextCanceled),
                Some(_) => {
                    return Err(Error::RetryDeadlineExceeded(RetryError::new(
                        attempt - 1,
                        errors,
                    )))
                }
                None => {}
            }

            let result = match self.balancer.endpoint() {
                Ok(endpoint) => {
                    tokio::select! {
                        biased;
                        err = loop_ctx.done() => {
                            if matches!(err, Error::ContextCanceled) {
                                return Err(Error::ContextCanceled);
                            }
                            errors.push(err);
                            let retry = RetryError::new(attempt, errors);
                            return Err(Error::RetryDeadlineExceeded(retry));
                        }
                        result = endpoint.call(loop_ctx.child(), req.clone()) => result,
                    }
                }
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            tracing::debug!(attempt, error = %err, "attempt failed");

            if let Some(callback) = &self.callback {
                let (keep_trying, replacement) = callback(attempt, &err);
                if !keep_trying {
                    return Err(replacement.unwrap_or(err));
                }
            }
            errors.push(err);
        }

        Err(Error::RetryExhausted(RetryError::new(
            self.max_attempts,
            errors,
        )))
    }
}

impl<B> fmt::Debug for Retry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("max_attempts", &self.max_attempts)
            .field("max_time", &self.max_time)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}
