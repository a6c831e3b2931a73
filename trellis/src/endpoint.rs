//! The [`Endpoint`] abstraction and its [`Middleware`] composition.

use crate::{Context, Error};
use futures::future::{self, BoxFuture, FutureExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

type CallFn<Req, Resp> =
    dyn Fn(Context, Req) -> BoxFuture<'static, Result<Resp, Error>> + Send + Sync;

/// A single RPC method: an async function from `(Context, Req)` to `Result<Resp, Error>`.
///
/// Endpoints are cheap to clone; every clone refers to the same underlying
/// function, which [`Endpoint::ptr_eq`] can observe.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use trellis::{Context, Endpoint};
///
/// let uppercase = Endpoint::new(|_ctx: Context, req: String| async move {
///     Ok::<_, trellis::Error>(req.to_uppercase())
/// });
///
/// let resp = uppercase.call(Context::new(), "hello".to_string()).await.unwrap();
/// assert_eq!(resp, "HELLO");
/// # }
/// ```
pub struct Endpoint<Req, Resp> {
    call: Arc<CallFn<Req, Resp>>,
}

impl<Req, Resp> Endpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
    {
        Self {
            call: Arc::new(move |ctx, req| f(ctx, req).boxed()),
        }
    }

    /// Adapt a tower [`Service`], driving a fresh clone to readiness on every call.
    pub fn from_service<S>(service: S) -> Self
    where
        S: Service<(Context, Req), Response = Resp> + Clone + Send + Sync + 'static,
        S::Error: Into<Error>,
        S::Future: Send + 'static,
    {
        Self::new(move |ctx, req| {
            service
                .clone()
                .oneshot((ctx, req))
                .map(|res| res.map_err(Into::into))
        })
    }

    /// An endpoint that does nothing and returns `Resp::default()`.
    pub fn nop() -> Self
    where
        Resp: Default,
    {
        Self::new(|_, _| future::ok(Resp::default()))
    }

    /// Hide the request and response types behind [`AnyMessage`].
    ///
    /// Requests of the wrong type fail with [`Error::BadCast`] before reaching this endpoint.
    pub fn erase(self) -> Endpoint<AnyMessage, AnyMessage> {
        Endpoint::new(move |ctx, req: AnyMessage| match req.downcast::<Req>() {
            Ok(req) => self
                .call(ctx, *req)
                .map(|res| res.map(|resp| Box::new(resp) as AnyMessage))
                .left_future(),
            Err(_) => future::err(Error::bad_cast::<Req>()).right_future(),
        })
    }
}

impl<Req, Resp> Endpoint<Req, Resp> {
    pub fn call(&self, ctx: Context, req: Req) -> BoxFuture<'static, Result<Resp, Error>> {
        (self.call)(ctx, req)
    }

    /// Returns true if both handles refer to the same endpoint.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&a.call) as *const (),
            Arc::as_ptr(&b.call) as *const (),
        )
    }
}

/// Type-erased message passed through an erased endpoint.
pub type AnyMessage = Box<dyn Any + Send>;

impl Endpoint<AnyMessage, AnyMessage> {
    /// Recover a typed view of an erased endpoint.
    ///
    /// A response of the wrong type fails with [`Error::BadCast`].
    pub fn downcast<Req, Resp>(self) -> Endpoint<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        Endpoint::new(move |ctx, req: Req| {
            self.call(ctx, Box::new(req)).map(|res| {
                res.and_then(|resp| {
                    resp.downcast::<Resp>()
                        .map(|resp| *resp)
                        .map_err(|_| Error::bad_cast::<Resp>())
                })
            })
        })
    }
}

impl<Req, Resp> Clone for Endpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}

impl<Req, Resp> fmt::Debug for Endpoint<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Endpoint")
            .field(&Arc::as_ptr(&self.call))
            .finish()
    }
}

impl<Req, Resp> Service<(Context, Req)> for Endpoint<Req, Resp> {
    type Response = Resp;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Resp, Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, (ctx, req): (Context, Req)) -> Self::Future {
        Endpoint::call(self, ctx, req)
    }
}

type WrapFn<Req, Resp> = dyn Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp> + Send + Sync;

/// A function from [`Endpoint`] to [`Endpoint`].
///
/// Every middleware in this crate is also a tower [`Layer`]; use
/// [`Middleware::from_layer`] to mix them into a [`chain`].
pub struct Middleware<Req, Resp> {
    wrap: Arc<WrapFn<Req, Resp>>,
}

impl<Req, Resp> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp> + Send + Sync + 'static,
    {
        Self { wrap: Arc::new(f) }
    }

    /// The middleware that returns its argument unchanged.
    pub fn identity() -> Self {
        Self::new(|next| next)
    }

    pub fn from_layer<L>(layer: L) -> Self
    where
        L: Layer<Endpoint<Req, Resp>, Service = Endpoint<Req, Resp>> + Send + Sync + 'static,
    {
        Self::new(move |next| layer.layer(next))
    }

    pub fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        (self.wrap)(next)
    }
}

impl<Req, Resp> Clone for Middleware<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            wrap: Arc::clone(&self.wrap),
        }
    }
}

impl<Req, Resp> fmt::Debug for Middleware<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware").finish_non_exhaustive()
    }
}

impl<Req, Resp> Layer<Endpoint<Req, Resp>> for Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Service = Endpoint<Req, Resp>;

    fn layer(&self, inner: Endpoint<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}

/// Compose middlewares: `outer` is the outermost wrapper and the last of `others` the innermost.
///
/// A request enters `outer` first and leaves it last.
pub fn chain<Req, Resp>(
    outer: Middleware<Req, Resp>,
    others: impl IntoIterator<Item = Middleware<Req, Resp>>,
) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let others: Vec<_> = others.into_iter().collect();
    Middleware::new(move |next| {
        let inner = others
            .iter()
            .rev()
            .fold(next, |endpoint, middleware| middleware.wrap(endpoint));
        outer.wrap(inner)
    })
}
