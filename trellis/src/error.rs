//! Error types shared by every endpoint, middleware and balancer.

use std::fmt;
use std::sync::Arc;

/// The error returned along the request path.
///
/// Errors produced by an inner endpoint travel outward unchanged unless a
/// middleware is explicitly configured to rewrite them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The balancer had no endpoints to select from.
    #[error("no endpoints available")]
    NoEndpointsAvailable,

    /// The retry loop ran out of time.
    #[error("retry deadline exceeded: {0}")]
    RetryDeadlineExceeded(RetryError),

    /// The retry loop used up every attempt.
    #[error("retry attempts exhausted: {0}")]
    RetryExhausted(RetryError),

    /// A circuit breaker refused the request.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// A rate limiter refused the request.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The request context was cancelled by the caller.
    #[error("context canceled")]
    ContextCanceled,

    /// The request context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A type-erased request or response did not hold the expected type.
    #[error("bad cast: expected {expected}")]
    BadCast {
        /// Name of the type the endpoint expected.
        expected: &'static str,
    },

    /// An authorization policy rejected the request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The service discovery backend reported a failure.
    #[error("discovery error: {0}")]
    Discovery(DiscoveryError),

    /// Error produced by the transport behind an endpoint.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl Error {
    /// Wrap any transport failure.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(anyhow::Error::new(err))
    }

    /// Build a [`Error::BadCast`] naming `T` as the expected type.
    pub fn bad_cast<T: ?Sized>() -> Self {
        Self::BadCast {
            expected: std::any::type_name::<T>(),
        }
    }

    /// Returns true if the error comes from the caller's context rather than the callee.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::ContextCanceled | Self::DeadlineExceeded)
    }
}

/// A discovery failure carried inside an [`Event`](crate::Event).
///
/// Cloning is cheap: the same failure is fanned out to every subscriber of an instancer.
#[derive(Clone)]
pub struct DiscoveryError(Arc<anyhow::Error>);

impl DiscoveryError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Returns true if both values share the same underlying failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<DiscoveryError> for Error {
    fn from(err: DiscoveryError) -> Self {
        Self::Discovery(err)
    }
}

/// Every error observed by a retry loop, in attempt order.
#[derive(Debug)]
pub struct RetryError {
    attempts: usize,
    errors: Vec<Error>,
}

impl RetryError {
    pub(crate) fn new(attempts: usize, errors: Vec<Error>) -> Self {
        Self { attempts, errors }
    }

    /// Number of attempts that were started.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// The per-attempt errors, oldest first.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// The error of the final attempt, if any attempt ran.
    pub fn last(&self) -> Option<&Error> {
        self.errors.last()
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "{} attempt(s), last error: {}", self.attempts, last),
            None => write!(f, "{} attempt(s)", self.attempts),
        }
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last().map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Rejected configuration passed to a constructor or builder.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max attempts must be at least 1")]
    ZeroAttempts,

    #[error("rate must be a finite, non-negative number of tokens per second, got {0}")]
    InvalidRate(f64),

    #[error("bucket capacity must be at least 1")]
    ZeroCapacity,

    #[error("tokens taken per request must be at least 1")]
    ZeroTake,
}
