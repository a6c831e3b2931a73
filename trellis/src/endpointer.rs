//! Binds an [`EndpointCache`] to an [`Instancer`] through a subscription.

use crate::{
    event_channel, Endpoint, EndpointCache, EndpointerOptions, Error, EventReceiver,
    EventSender, Factory, Instancer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// Anything that can list the endpoints currently available for a service.
pub trait EndpointSource<Req, Resp>: Send + Sync {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error>;
}

impl<Req, Resp, T> EndpointSource<Req, Resp> for Arc<T>
where
    T: EndpointSource<Req, Resp> + ?Sized,
{
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error> {
        (**self).endpoints()
    }
}

/// A fixed set of endpoints, for static topologies and tests.
pub struct FixedEndpoints<Req, Resp>(Arc<[Endpoint<Req, Resp>]>);

impl<Req, Resp> FixedEndpoints<Req, Resp> {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint<Req, Resp>>) -> Self {
        Self(endpoints.into_iter().collect())
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for FixedEndpoints<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error> {
        Ok(Arc::clone(&self.0))
    }
}

/// Keeps an [`EndpointCache`] in sync with an [`Instancer`].
///
/// A receiver task drains the subscription channel into the cache until the
/// endpointer is closed or dropped. Closing deregisters from the instancer and
/// closes every cached endpoint.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use trellis::{Closer, Context, Endpoint, Endpointer, FixedInstancer};
///
/// let factory = |instance: &str| {
///     let instance = instance.to_string();
///     let endpoint = Endpoint::new(move |_ctx: Context, _req: ()| {
///         let instance = instance.clone();
///         async move { Ok::<_, trellis::Error>(instance) }
///     });
///     Ok::<_, anyhow::Error>((endpoint, None::<Closer>))
/// };
///
/// let endpointer = Endpointer::builder(Arc::new(FixedInstancer::new(["10.0.0.1:80"])), factory)
///     .invalidate_on_error(std::time::Duration::from_secs(5))
///     .build();
///
/// assert_eq!(endpointer.endpoints().unwrap().len(), 1);
/// # }
/// ```
pub struct Endpointer<Req, Resp> {
    cache: Arc<EndpointCache<Req, Resp>>,
    instancer: Arc<dyn Instancer>,
    sender: EventSender,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<Req, Resp> Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Start configuring an `Endpointer` for the service `instancer` tracks,
    /// using `factory` to build one endpoint per instance.
    pub fn builder<I, F>(instancer: Arc<I>, factory: F) -> EndpointerBuilder<Req, Resp>
    where
        I: Instancer + 'static,
        F: Factory<Req, Resp> + 'static,
    {
        EndpointerBuilder {
            instancer,
            factory: Box::new(factory),
            options: EndpointerOptions::default(),
        }
    }

    fn start(
        instancer: Arc<dyn Instancer>,
        factory: Box<dyn Factory<Req, Resp>>,
        options: EndpointerOptions,
    ) -> Self {
        let cache = Arc::new(EndpointCache::from_boxed(factory, options));
        let (sender, mut receiver) = event_channel();

        instancer.register(sender.clone());
        // Apply the state delivered by `register` before anyone can ask for endpoints.
        if let Some(event) = receiver.try_recv() {
            cache.update(event);
        }

        let shutdown = CancellationToken::new();
        tokio::spawn(
            receive(Arc::clone(&cache), receiver, shutdown.clone())
                .instrument(tracing::debug_span!("endpointer")),
        );

        Self {
            cache,
            instancer,
            sender,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }
}

impl<Req, Resp> Endpointer<Req, Resp> {
    pub fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error> {
        self.cache.endpoints()
    }

    /// Deregister from the instancer, stop the receiver and close every endpoint.
    ///
    /// Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.instancer.deregister(&self.sender);
        self.shutdown.cancel();
        self.cache.close();
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for Endpointer<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, Error> {
        self.cache.endpoints()
    }
}

impl<Req, Resp> Drop for Endpointer<Req, Resp> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive<Req, Resp>(
    cache: Arc<EndpointCache<Req, Resp>>,
    mut receiver: EventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => event,
        };
        match event {
            Some(event) => cache.update(event),
            None => break,
        }
    }
    tracing::debug!("endpointer receiver stopped");
}

/// Builder to configure and create an [`Endpointer`].
pub struct EndpointerBuilder<Req, Resp> {
    instancer: Arc<dyn Instancer>,
    factory: Box<dyn Factory<Req, Resp>>,
    options: EndpointerOptions,
}

impl<Req, Resp> EndpointerBuilder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Drop every endpoint once a discovery error has persisted for `timeout`.
    ///
    /// By default discovery errors are logged and the last known endpoints are kept.
    pub fn invalidate_on_error(self, timeout: Duration) -> Self {
        Self {
            options: EndpointerOptions::invalidate_on_error(timeout),
            ..self
        }
    }

    /// Set the [`EndpointerOptions`] wholesale.
    pub fn options(self, options: EndpointerOptions) -> Self {
        Self { options, ..self }
    }

    /// Subscribe to the instancer and spawn the receiver task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Endpointer<Req, Resp> {
        Endpointer::start(self.instancer, self.factory, self.options)
    }
}

const _: () = {
    const fn assert_is_send_sync<T: Send + Sync>() {}
    assert_is_send_sync::<Endpointer<(), ()>>();
    assert_is_send_sync::<EndpointerBuilder<(), ()>>();
};
