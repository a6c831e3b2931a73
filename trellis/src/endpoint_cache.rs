//! Differential cache of per-instance endpoints, rebuilt from discovery events.

use crate::{Closer, DiscoveryError, Endpoint, EndpointSource, Error, Event, Factory};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// How an [`EndpointCache`] reacts to discovery errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointerOptions {
    /// Drop every endpoint once a discovery error has persisted for `invalidate_timeout`.
    ///
    /// When false, discovery errors are logged and the last known endpoints are kept forever.
    pub invalidate_on_error: bool,
    pub invalidate_timeout: Duration,
}

impl EndpointerOptions {
    pub fn invalidate_on_error(timeout: Duration) -> Self {
        Self {
            invalidate_on_error: true,
            invalidate_timeout: timeout,
        }
    }
}

struct CachedEndpoint<Req, Resp> {
    endpoint: Endpoint<Req, Resp>,
    closer: Option<Closer>,
}

impl<Req, Resp> CachedEndpoint<Req, Resp> {
    fn close(self) {
        if let Some(closer) = self.closer {
            closer.close();
        }
    }
}

struct CacheState<Req, Resp> {
    cache: HashMap<String, CachedEndpoint<Req, Resp>>,
    // Sorted by instance address.
    endpoints: Arc<[Endpoint<Req, Resp>]>,
    err: Option<DiscoveryError>,
    invalidate_deadline: Option<Instant>,
    closed: bool,
}

impl<Req, Resp> CacheState<Req, Resp> {
    fn invalidated(&self, now: Instant) -> Option<&DiscoveryError> {
        match (&self.err, self.invalidate_deadline) {
            (Some(err), Some(deadline)) if now >= deadline => Some(err),
            _ => None,
        }
    }

    fn close_all(&mut self) {
        for (instance, cached) in self.cache.drain() {
            tracing::debug!(instance = %instance, "closing endpoint");
            cached.close();
        }
        self.endpoints = Vec::new().into();
    }
}

/// Keeps one endpoint per live instance, reconciling it with each discovery [`Event`].
///
/// Endpoints of instances that stay in the set are reused, never rebuilt;
/// instances that leave the set have their [`Closer`] invoked exactly once.
/// [`EndpointCache::endpoints`] returns the endpoints ordered by instance address.
///
/// A discovery error either leaves the cache untouched, or (with
/// [`EndpointerOptions::invalidate_on_error`]) keeps serving the last known
/// endpoints until the timeout passes, after which every endpoint is closed and
/// the error is returned until the next healthy event.
pub struct EndpointCache<Req, Resp> {
    factory: Box<dyn Factory<Req, Resp>>,
    options: EndpointerOptions,
    state: RwLock<CacheState<Req, Resp>>,
}

impl<Req, Resp> EndpointCache<Req, Resp> {
    pub fn new<F>(factory: F, options: EndpointerOptions) -> Self
    where
        F: Factory<Req, Resp> + 'static,
    {
        Self::from_boxed(Box::new(factory), options)
    }

    pub(crate) fn from_boxed(
        factory: Box<dyn Factory<Req, Resp>>,
        options: EndpointerOptions,
    ) -> Self {
        Self {
            factory,
            options,
            state: RwLock::new(CacheState {
                cache: HashMap::new(),
                endpoints: Vec::new().into(),
                err: None,
                invalidate_deadline: None,
                closed: false,
            }),
        }
    }

    /// Reconcile the cache with `event`.
    pub fn update(&self, event: Event) {
        match event.err {
            Some(err) => self.update_error(err),
            None => self.update_instances(event.instances),
        }
    }

    fn update_instances(&self, mut instances: Vec<String>) {
        instances.sort();
        instances.dedup();

        // Factory calls run under the upgradable lock: readers keep being served
        // the previous set until the new one is swapped in below.
        let state = self.state.upgradable_read();
        if state.closed {
            return;
        }

        let mut created = HashMap::new();
        for instance in &instances {
            if state.cache.contains_key(instance) {
                continue;
            }
            match self.factory.make(instance) {
                Ok((endpoint, closer)) => {
                    tracing::info!(instance = %instance, "created endpoint");
                    created.insert(instance.clone(), CachedEndpoint { endpoint, closer });
                }
                Err(err) => {
                    tracing::warn!(instance = %instance, error = %err, "failed to create endpoint");
                }
            }
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let mut next = HashMap::with_capacity(instances.len());
        let mut endpoints = Vec::with_capacity(instances.len());
        for instance in instances {
            let cached = match state.cache.remove(&instance) {
                Some(cached) => cached,
                None => match created.remove(&instance) {
                    Some(cached) => cached,
                    None => continue,
                },
            };
            endpoints.push(cached.endpoint.clone());
            next.insert(instance, cached);
        }

        let removed = std::mem::replace(&mut state.cache, next);
        for (instance, cached) in removed {
            tracing::info!(instance = %instance, "closing endpoint of departed instance");
            cached.close();
        }

        state.endpoints = endpoints.into();
        state.err = None;
        state.invalidate_deadline = None;
    }

    fn update_error(&self, err: DiscoveryError) {
        if !self.options.invalidate_on_error {
            tracing::warn!(error = %err, "discovery error, keeping last known endpoints");
            return;
        }

        let mut state = self.state.write();
        if state.closed || state.err.is_some() {
            // Already degraded: the original deadline stands.
            return;
        }
        tracing::warn!(
            error = %err,
            timeout = ?self.options.invalidate_timeout,
            "discovery error, endpoints will be invalidated after timeout"
        );
        state.err = Some(err);
        state.invalidate_deadline = Some(Instant::now() + self.options.invalidate_timeout);
    }

    /// The current endpoints, ordered by instance address.
    pub fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error> {
        {
            let state = self.state.read();
            if state.invalidated(Instant::now()).is_none() {
                return Ok(Arc::clone(&state.endpoints));
            }
        }

        let mut state = self.state.write();
        let err = match state.invalidated(Instant::now()) {
            Some(err) => err.clone(),
            // A healthy event landed between releasing the read lock and taking the write lock.
            None => return Ok(Arc::clone(&state.endpoints)),
        };
        if !state.cache.is_empty() {
            tracing::warn!(error = %err, "invalidating endpoints after persistent discovery error");
            state.close_all();
        }
        Err(Error::Discovery(err))
    }

    /// Close every endpoint. Later events are ignored.
    pub fn close(&self) {
        let mut state = self.state.write();
        state.closed = true;
        state.close_all();
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for EndpointCache<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error> {
        EndpointCache::endpoints(self)
    }
}
