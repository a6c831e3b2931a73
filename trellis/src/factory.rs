//! Turns an instance address into an [`Endpoint`] and the [`Closer`] that
//! releases its resources.

use crate::Endpoint;
use std::fmt;

/// Constructs the endpoint for one instance address.
///
/// Called synchronously by the [`EndpointCache`](crate::EndpointCache); transport dial
/// timeouts are the factory's concern. An `Err` means the instance is not usable
/// right now: the cache logs it and leaves the instance out of its set.
pub trait Factory<Req, Resp>: Send + Sync {
    fn make(&self, instance: &str) -> Result<(Endpoint<Req, Resp>, Option<Closer>), anyhow::Error>;
}

impl<Req, Resp, F> Factory<Req, Resp> for F
where
    F: Fn(&str) -> Result<(Endpoint<Req, Resp>, Option<Closer>), anyhow::Error> + Send + Sync,
{
    fn make(&self, instance: &str) -> Result<(Endpoint<Req, Resp>, Option<Closer>), anyhow::Error> {
        self(instance)
    }
}

/// Releases the transport resources behind an endpoint, exactly once.
///
/// [`Closer::close`] consumes the closer. A closer that is dropped without being
/// closed runs on drop instead.
pub struct Closer {
    close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Closer {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            close: Some(Box::new(f)),
        }
    }

    pub fn close(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.close.is_none())
            .finish()
    }
}
