//! Authorization gate: a middleware that consults a [`Policy`] before
//! letting a request through.

use crate::{Context, Endpoint, Error, Middleware};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tower_layer::Layer;

/// Context metadata key holding the caller's credentials.
pub const AUTHORIZATION: &str = "authorization";

/// Decides whether a request may reach the endpoint behind a [`Gate`].
///
/// Any error returned is handed to the caller as is; the endpoint is not called.
#[async_trait]
pub trait Policy<Req>: Send + Sync {
    async fn allow(&self, ctx: &Context, req: &Req) -> Result<(), Error>;
}

#[async_trait]
impl<Req, P> Policy<Req> for Arc<P>
where
    Req: Sync,
    P: Policy<Req> + ?Sized,
{
    async fn allow(&self, ctx: &Context, req: &Req) -> Result<(), Error> {
        (**self).allow(ctx, req).await
    }
}

/// A [`Policy`] backed by a synchronous function. See [`policy_fn`].
#[derive(Clone)]
pub struct PolicyFn<F>(F);

/// Turn `f` into a [`Policy`].
pub fn policy_fn<Req, F>(f: F) -> PolicyFn<F>
where
    F: Fn(&Context, &Req) -> Result<(), Error> + Send + Sync,
{
    PolicyFn(f)
}

#[async_trait]
impl<Req, F> Policy<Req> for PolicyFn<F>
where
    Req: Sync,
    F: Fn(&Context, &Req) -> Result<(), Error> + Send + Sync,
{
    async fn allow(&self, ctx: &Context, req: &Req) -> Result<(), Error> {
        (self.0)(ctx, req)
    }
}

impl<F> fmt::Debug for PolicyFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyFn").finish_non_exhaustive()
    }
}

/// Accepts requests carrying `authorization: Bearer <token>` metadata for a known token.
#[derive(Debug, Clone, Default)]
pub struct BearerTokens {
    tokens: HashSet<String>,
}

impl BearerTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, ctx: &Context) -> Result<(), Error> {
        let header = ctx
            .metadata(AUTHORIZATION)
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthorized("malformed authorization metadata".to_string()))?;
        if self.tokens.contains(token.trim()) {
            Ok(())
        } else {
            Err(Error::Unauthorized("invalid bearer token".to_string()))
        }
    }
}

#[async_trait]
impl<Req: Sync> Policy<Req> for BearerTokens {
    async fn allow(&self, ctx: &Context, _req: &Req) -> Result<(), Error> {
        self.check(ctx)
    }
}

/// Calls the wrapped endpoint only if the [`Policy`] allows the request.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use trellis::{BearerTokens, Context, Endpoint, Error, Gate};
///
/// let hello = Endpoint::new(|_ctx: Context, name: String| async move {
///     Ok::<_, Error>(format!("hello {}", name))
/// });
/// let guarded = Gate::new(BearerTokens::new(["s3cr3t"])).wrap(hello);
///
/// let ctx = Context::new().with_metadata("authorization", "Bearer s3cr3t");
/// assert_eq!(guarded.call(ctx, "ada".into()).await.unwrap(), "hello ada");
/// assert!(matches!(
///     guarded.call(Context::new(), "ada".into()).await,
///     Err(Error::Unauthorized(_))
/// ));
/// # }
/// ```
pub struct Gate<P> {
    policy: Arc<P>,
}

impl<P> Gate<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn wrap<Req, Resp>(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
    where
        P: Policy<Req> + 'static,
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let policy = Arc::clone(&self.policy);
        Endpoint::new(move |ctx: Context, req: Req| {
            let policy = Arc::clone(&policy);
            let next = next.clone();
            async move {
                if let Err(err) = policy.allow(&ctx, &req).await {
                    tracing::debug!(request_id = ctx.request_id(), error = %err, "request denied");
                    return Err(err);
                }
                next.call(ctx, req).await
            }
        })
    }

    pub fn middleware<Req, Resp>(&self) -> Middleware<Req, Resp>
    where
        P: Policy<Req> + 'static,
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let gate = self.clone();
        Middleware::new(move |next| gate.wrap(next))
    }
}

impl<P> Clone for Gate<P> {
    fn clone(&self) -> Self {
        Self {
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<P> fmt::Debug for Gate<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate").finish_non_exhaustive()
    }
}

impl<P, Req, Resp> Layer<Endpoint<Req, Resp>> for Gate<P>
where
    P: Policy<Req> + 'static,
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    type Service = Endpoint<Req, Resp>;

    fn layer(&self, inner: Endpoint<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}
