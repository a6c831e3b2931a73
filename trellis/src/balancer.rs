//! Selection strategies over the endpoints of an [`EndpointSource`].

use crate::{Endpoint, EndpointSource, Error};
use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Picks one endpoint per request.
pub trait Balancer<Req, Resp>: Send + Sync {
    /// Select an endpoint from the current set.
    ///
    /// Fails with [`Error::NoEndpointsAvailable`] when the set is empty and
    /// forwards any error reported by the underlying source.
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error>;

    /// An endpoint that selects a fresh endpoint on every invocation and dispatches to it.
    fn into_endpoint(self) -> Endpoint<Req, Resp>
    where
        Self: Sized + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let balancer = Arc::new(self);
        Endpoint::new(move |ctx, req| match balancer.endpoint() {
            Ok(endpoint) => endpoint.call(ctx, req).left_future(),
            Err(err) => future::err(err).right_future(),
        })
    }
}

impl<Req, Resp, B> Balancer<Req, Resp> for Arc<B>
where
    B: Balancer<Req, Resp> + ?Sized,
{
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error> {
        (**self).endpoint()
    }
}

/// Cycles through the endpoints in address order.
///
/// The counter is never reset when membership changes: resetting it would
/// send the next requests to the lowest addresses and starve instances that
/// sort late.
#[derive(Debug)]
pub struct RoundRobin<S> {
    source: S,
    counter: AtomicU64,
}

impl<S> RoundRobin<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            counter: AtomicU64::new(0),
        }
    }
}

impl<Req, Resp, S> Balancer<Req, Resp> for RoundRobin<S>
where
    S: EndpointSource<Req, Resp>,
{
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error> {
        let endpoints = self.source.endpoints()?;
        if endpoints.is_empty() {
            return Err(Error::NoEndpointsAvailable);
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(endpoints[(n % endpoints.len() as u64) as usize].clone())
    }
}

/// Picks an endpoint uniformly at random.
#[derive(Debug)]
pub struct Random<S> {
    source: S,
    rng: Mutex<StdRng>,
}

impl<S> Random<S> {
    /// A balancer with a seeded generator, so selections can be replayed.
    pub fn new(source: S, seed: u64) -> Self {
        Self {
            source,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy(source: S) -> Self {
        Self {
            source,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl<Req, Resp, S> Balancer<Req, Resp> for Random<S>
where
    S: EndpointSource<Req, Resp>,
{
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error> {
        let endpoints = self.source.endpoints()?;
        if endpoints.is_empty() {
            return Err(Error::NoEndpointsAvailable);
        }
        let idx = self.rng.lock().gen_range(0..endpoints.len());
        Ok(endpoints[idx].clone())
    }
}
