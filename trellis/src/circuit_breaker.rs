//! A three-state circuit breaker middleware.
//!
//! Closed: requests pass and outcomes are counted. Once `ready_to_trip` says
//! so the breaker opens and rejects everything with [`Error::CircuitOpen`]
//! until `timeout` passes. It then lets up to `max_requests` probes through
//! (half-open): a failed probe re-opens it, `max_requests` consecutive
//! successes close it.

use crate::{Endpoint, Error, Middleware};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tower_layer::Layer;

static DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        })
    }
}

/// Request outcomes observed in the current generation.
///
/// Counts are cleared on every state change and, while closed, at the end
/// of every `interval`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

// Counts saturate: with a zero interval a closed breaker never clears them.
impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

type TripFn = dyn Fn(&Counts) -> bool + Send + Sync;
type FailureFn = dyn Fn(&Error) -> bool + Send + Sync;
type StateChangeFn = dyn Fn(&str, CircuitState, CircuitState) + Send + Sync;

/// Trips once `n` failures were seen in the current counting interval.
pub fn trip_after_failures(n: u32) -> impl Fn(&Counts) -> bool + Send + Sync + 'static {
    move |counts: &Counts| counts.total_failures >= n
}

/// Trips once at least `min_requests` requests were seen and the share of
/// failures among them reaches `ratio`.
pub fn trip_on_failure_ratio(
    ratio: f64,
    min_requests: u32,
) -> impl Fn(&Counts) -> bool + Send + Sync + 'static {
    move |counts: &Counts| {
        counts.requests >= min_requests
            && counts.requests > 0
            && f64::from(counts.total_failures) / f64::from(counts.requests) >= ratio
    }
}

/// Configuration of a [`CircuitBreaker`].
#[derive(Clone)]
pub struct BreakerSettings {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: Arc<TripFn>,
    is_failure: Arc<FailureFn>,
    on_state_change: Option<Arc<StateChangeFn>>,
}

impl BreakerSettings {
    /// Defaults: one half-open probe, counts never reset while closed,
    /// a 60 second open period, tripping after more than 5 consecutive
    /// failures, and every error counted as a failure.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: DEFAULT_TIMEOUT,
            ready_to_trip: Arc::new(|counts: &Counts| counts.consecutive_failures > 5),
            is_failure: Arc::new(|_: &Error| true),
            on_state_change: None,
        }
    }

    /// Number of requests let through while half-open. Zero is treated as one.
    pub fn max_requests(self, max_requests: u32) -> Self {
        Self {
            max_requests: max_requests.max(1),
            ..self
        }
    }

    /// Length of the closed-state counting window. Zero never clears the counts.
    pub fn interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    /// How long the breaker stays open before probing. Zero restores the default.
    pub fn timeout(self, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        Self { timeout, ..self }
    }

    /// Called with the closed-state counts after every failure.
    pub fn ready_to_trip<F>(self, f: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        Self {
            ready_to_trip: Arc::new(f),
            ..self
        }
    }

    /// Decides which errors count as failures; the others count as successes.
    pub fn is_failure<F>(self, f: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        Self {
            is_failure: Arc::new(f),
            ..self
        }
    }

    /// Called with the breaker name, the previous and the new state after every transition.
    pub fn on_state_change<F>(self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        Self {
            on_state_change: Some(Arc::new(f)),
            ..self
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    // Closed: end of the counting window. Open: end of the open period.
    expiry: Option<Instant>,
}

type Transition = (CircuitState, CircuitState);

/// Shared breaker state. Clones observe and drive the same breaker.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use trellis::{trip_after_failures, BreakerSettings, CircuitBreaker, Context, Endpoint, Error};
///
/// let breaker = CircuitBreaker::new(
///     BreakerSettings::new("billing").ready_to_trip(trip_after_failures(1)),
/// );
/// let flaky = Endpoint::new(|_ctx: Context, _req: ()| async {
///     Err::<(), _>(Error::Transport(anyhow::anyhow!("connection refused")))
/// });
/// let guarded = breaker.wrap(flaky);
///
/// assert!(matches!(guarded.call(Context::new(), ()).await, Err(Error::Transport(_))));
/// assert!(matches!(guarded.call(Context::new(), ()).await, Err(Error::CircuitOpen)));
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    settings: Arc<BreakerSettings>,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let now = Instant::now();
        let mut state = BreakerState {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        new_generation(&settings, &mut state, now);
        Self {
            settings: Arc::new(settings),
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    pub fn counts(&self) -> Counts {
        let (counts, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.counts, transition)
        };
        self.notify(transition);
        counts
    }

    /// Guard `next` with this breaker.
    pub fn wrap<Req, Resp>(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let breaker = self.clone();
        Endpoint::new(move |ctx, req| {
            let breaker = breaker.clone();
            let next = next.clone();
            async move {
                let generation = breaker.before_request()?;
                let outcome = AssertUnwindSafe(next.call(ctx, req)).catch_unwind().await;
                match outcome {
                    Ok(result) => {
                        let success = match &result {
                            Ok(_) => true,
                            Err(err) => !(breaker.settings.is_failure)(err),
                        };
                        breaker.after_request(generation, success);
                        result
                    }
                    Err(panic) => {
                        breaker.after_request(generation, false);
                        std::panic::resume_unwind(panic)
                    }
                }
            }
        })
    }

    pub fn middleware<Req, Resp>(&self) -> Middleware<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let breaker = self.clone();
        Middleware::new(move |next| breaker.wrap(next))
    }

    fn before_request(&self) -> Result<u64, Error> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            let state = inner.state;
            let result = match state {
                CircuitState::Open => Err(Error::CircuitOpen),
                CircuitState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                    Err(Error::CircuitOpen)
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (result, transition)
        };
        self.notify(transition);
        result
    }

    fn after_request(&self, generation: u64, success: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let refreshed = self.refresh(&mut inner, now);
            // The result belongs to an earlier generation; it says nothing about the current one.
            if inner.generation != generation {
                refreshed
            } else if success {
                self.on_success(&mut inner, now).or(refreshed)
            } else {
                self.on_failure(&mut inner, now).or(refreshed)
            }
        };
        self.notify(transition);
    }

    fn on_success(&self, inner: &mut BreakerState, now: Instant) -> Option<Transition> {
        inner.counts.on_success();
        if inner.state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.settings.max_requests
        {
            return self.set_state(inner, CircuitState::Closed, now);
        }
        None
    }

    fn on_failure(&self, inner: &mut BreakerState, now: Instant) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if (self.settings.ready_to_trip)(&inner.counts) {
                    return self.set_state(inner, CircuitState::Open, now);
                }
                None
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => None,
        }
    }

    /// Apply time-driven changes: a closed window rolling over, or an open period ending.
    fn refresh(&self, inner: &mut BreakerState, now: Instant) -> Option<Transition> {
        match (inner.state, inner.expiry) {
            (CircuitState::Closed, Some(expiry)) if expiry <= now => {
                new_generation(&self.settings, inner, now);
                None
            }
            (CircuitState::Open, Some(expiry)) if expiry <= now => {
                self.set_state(inner, CircuitState::HalfOpen, now)
            }
            _ => None,
        }
    }

    fn set_state(
        &self,
        inner: &mut BreakerState,
        state: CircuitState,
        now: Instant,
    ) -> Option<Transition> {
        if inner.state == state {
            return None;
        }
        let prev = std::mem::replace(&mut inner.state, state);
        new_generation(&self.settings, inner, now);
        Some((prev, state))
    }

    // Runs outside the lock so hooks may inspect the breaker.
    fn notify(&self, transition: Option<Transition>) {
        if let Some((from, to)) = transition {
            tracing::info!(
                breaker = %self.settings.name,
                %from,
                %to,
                "circuit breaker state changed"
            );
            if let Some(hook) = &self.settings.on_state_change {
                hook(&self.settings.name, from, to);
            }
        }
    }
}

fn new_generation(settings: &BreakerSettings, inner: &mut BreakerState, now: Instant) {
    inner.generation += 1;
    inner.counts = Counts::default();
    inner.expiry = match inner.state {
        CircuitState::Closed if settings.interval.is_zero() => None,
        CircuitState::Closed => Some(now + settings.interval),
        CircuitState::Open => Some(now + settings.timeout),
        CircuitState::HalfOpen => None,
    };
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("settings", &self.settings)
            .field("state", &*self.inner.lock())
            .finish()
    }
}

impl<Req, Resp> Layer<Endpoint<Req, Resp>> for CircuitBreaker
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Service = Endpoint<Req, Resp>;

    fn layer(&self, inner: Endpoint<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}

const _: () = {
    const fn assert_is_send_sync<T: Send + Sync>() {}
    assert_is_send_sync::<CircuitBreaker>();
};
