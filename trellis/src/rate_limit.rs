//! Token-bucket rate limiting: [`RateLimiter`] rejects requests over the
//! rate, [`Throttler`] delays them.

use crate::{ConfigError, Context, Endpoint, Error, Middleware};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tower_layer::Layer;

/// A token bucket refilled continuously at `rate` tokens per second, holding
/// at most `capacity` tokens. It starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    // Negative while reservations are outstanding.
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: u64) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ConfigError::InvalidRate(rate));
        }
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens currently in the bucket; negative while reservations are pending.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Take `n` tokens if they are all available right now.
    pub fn try_take(&self, n: u64) -> bool {
        self.try_take_at(n, Instant::now())
    }

    fn try_take_at(&self, n: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens now, going into debt if needed, and return how long
    /// the caller must wait before they are actually covered.
    ///
    /// Returns `None`, taking nothing, when `n` can never be covered: `n`
    /// exceeds the capacity, or the bucket is short and refills too slowly
    /// for the wait to fit in a [`Duration`].
    pub fn reserve(&self, n: u64) -> Option<Duration> {
        if n > self.capacity {
            return None;
        }
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        let shortfall = n as f64 - state.tokens;
        if shortfall <= 0.0 {
            state.tokens -= n as f64;
            return Some(Duration::ZERO);
        }
        if self.rate == 0.0 {
            return None;
        }
        let wait = Duration::try_from_secs_f64(shortfall / self.rate).ok()?;
        state.tokens -= n as f64;
        Some(wait)
    }

    /// Give back `n` tokens from an abandoned reservation.
    pub fn refund(&self, n: u64) {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens = (state.tokens + n as f64).min(self.capacity as f64);
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last);
        state.last = state.last.max(now);
        let refilled = state.tokens + elapsed.as_secs_f64() * self.rate;
        state.tokens = refilled.min(self.capacity as f64);
    }
}

fn validate_take(take: u64) -> Result<u64, ConfigError> {
    if take == 0 {
        Err(ConfigError::ZeroTake)
    } else {
        Ok(take)
    }
}

/// Fails requests with [`Error::RateLimited`] when the bucket cannot cover them.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<TokenBucket>,
    take: u64,
}

impl RateLimiter {
    /// A limiter taking one token per request.
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket, take: 1 }
    }

    /// Tokens taken per request.
    pub fn take(self, take: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            take: validate_take(take)?,
            ..self
        })
    }

    pub fn wrap<Req, Resp>(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let limiter = self.clone();
        Endpoint::new(move |ctx, req| {
            if limiter.bucket.try_take(limiter.take) {
                next.call(ctx, req)
            } else {
                tracing::debug!(request_id = ctx.request_id(), "rate limited");
                futures::future::err(Error::RateLimited).boxed()
            }
        })
    }

    pub fn middleware<Req, Resp>(&self) -> Middleware<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let limiter = self.clone();
        Middleware::new(move |next| limiter.wrap(next))
    }
}

impl<Req, Resp> Layer<Endpoint<Req, Resp>> for RateLimiter
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Service = Endpoint<Req, Resp>;

    fn layer(&self, inner: Endpoint<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}

type SleepFn = dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync;

/// Delays requests until the bucket covers them.
///
/// The wait is raced against the request context: a request whose context
/// is cancelled or expires while waiting is not sent, and its reserved
/// tokens are returned to the bucket.
#[derive(Clone)]
pub struct Throttler {
    bucket: Arc<TokenBucket>,
    take: u64,
    sleep: Arc<SleepFn>,
}

impl Throttler {
    /// A throttler taking one token per request and waiting with [`tokio::time::sleep`].
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self {
            bucket,
            take: 1,
            sleep: Arc::new(|wait: Duration| tokio::time::sleep(wait).boxed()),
        }
    }

    /// Tokens taken per request.
    pub fn take(self, take: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            take: validate_take(take)?,
            ..self
        })
    }

    /// Replace the function used to wait for tokens.
    pub fn sleep_with<F, Fut>(self, sleep: F) -> Self
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            sleep: Arc::new(move |wait: Duration| sleep(wait).boxed()),
            ..self
        }
    }

    pub fn wrap<Req, Resp>(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let throttler = self.clone();
        Endpoint::new(move |ctx: Context, req| {
            let throttler = throttler.clone();
            let next = next.clone();
            async move {
                let wait = throttler
                    .bucket
                    .reserve(throttler.take)
                    .ok_or(Error::RateLimited)?;
                if !wait.is_zero() {
                    tracing::debug!(request_id = ctx.request_id(), ?wait, "throttling request");
                    tokio::select! {
                        biased;
                        err = ctx.done() => {
                            throttler.bucket.refund(throttler.take);
                            return Err(err);
                        }
                        _ = (throttler.sleep)(wait) => {}
                    }
                }
                next.call(ctx, req).await
            }
        })
    }

    pub fn middleware<Req, Resp>(&self) -> Middleware<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let throttler = self.clone();
        Middleware::new(move |next| throttler.wrap(next))
    }
}

impl fmt::Debug for Throttler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("bucket", &self.bucket)
            .field("take", &self.take)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> Layer<Endpoint<Req, Resp>> for Throttler
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Service = Endpoint<Req, Resp>;

    fn layer(&self, inner: Endpoint<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}
