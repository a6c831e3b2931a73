//! `trellis` offers composable RPC [`Endpoint`]s and a client-side [`Endpointer`]
//! that keeps one endpoint per live instance of a remote service, driven by a
//! pluggable service discovery.
//!
//! # Simple example
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use std::sync::Arc;
//!     use trellis::{Balancer, Closer, Context, Endpoint, Endpointer, FixedInstancer, RoundRobin};
//!
//!     // One endpoint per instance address. A real factory would dial a connection here.
//!     let factory = |instance: &str| {
//!         let instance = instance.to_string();
//!         let endpoint = Endpoint::new(move |_ctx: Context, req: String| {
//!             let instance = instance.clone();
//!             async move { Ok::<_, trellis::Error>(format!("{} handled {}", instance, req)) }
//!         });
//!         Ok::<_, anyhow::Error>((endpoint, None::<Closer>))
//!     };
//!
//!     let instancer = Arc::new(FixedInstancer::new(["10.0.0.1:8080", "10.0.0.2:8080"]));
//!     let endpointer = Endpointer::builder(instancer, factory).build();
//!     let endpoint = RoundRobin::new(endpointer).into_endpoint();
//!
//!     let resp = endpoint.call(Context::new(), "ping".to_string()).await.unwrap();
//!     assert_eq!(resp, "10.0.0.1:8080 handled ping");
//! }
//! ```
//!
//! Instances can be discovered by polling any implementation of [`LookupService`].
//!
//! ```rust
//! use std::collections::HashSet;
//! use trellis::LookupService;
//!
//! // Reads the instances from somewhere; this one always finds the same two.
//! struct StaticLookup;
//!
//! #[async_trait::async_trait]
//! impl LookupService for StaticLookup {
//!     async fn resolve_service_instances(&self) -> Result<HashSet<String>, anyhow::Error> {
//!         Ok(HashSet::from(["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()]))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     use std::time::Duration;
//!     use trellis::{PollingInstancer, ResolutionStrategy};
//!
//!     let instancer = PollingInstancer::builder(StaticLookup)
//!         .probe_interval(Duration::from_secs(3))
//!         .resolution_strategy(ResolutionStrategy::Eager {
//!             timeout: Duration::from_secs(5),
//!         })
//!         .build()
//!         .await
//!         .expect("failed to construct PollingInstancer");
//!
//!     assert_eq!(instancer.state().instances.len(), 2);
//! }
//! ```
//!
//! Resiliency is layered with [`Middleware`]. A request enters the first
//! middleware of a [`chain`] first.
//!
//! ```rust
//! #[tokio::main]
//! async fn main() {
//!     use std::sync::Arc;
//!     use std::time::Duration;
//!     use trellis::{
//!         chain, instrument, BreakerSettings, CircuitBreaker, Context, Endpoint, RateLimiter,
//!         TokenBucket,
//!     };
//!
//!     let bucket = Arc::new(TokenBucket::new(100.0, 10).expect("valid bucket"));
//!     let breaker =
//!         CircuitBreaker::new(BreakerSettings::new("inventory").timeout(Duration::from_secs(30)));
//!
//!     let middleware = chain(
//!         instrument("get_stock"),
//!         vec![RateLimiter::new(bucket).middleware(), breaker.middleware()],
//!     );
//!     let endpoint = middleware.wrap(Endpoint::new(|_ctx: Context, sku: u64| async move {
//!         Ok::<_, trellis::Error>(sku % 7)
//!     }));
//!
//!     assert_eq!(endpoint.call(Context::new(), 15).await.unwrap(), 1);
//! }
//! ```
//!
//! # Internals
//! An [`Instancer`] pushes [`Event`]s into a single-slot channel per subscriber.
//! The [`Endpointer`] drains its channel on a spawned task into an [`EndpointCache`],
//! which calls the [`Factory`] only for new instances and closes the endpoints of
//! departed ones. Balancers read the cache's current list on every request.

mod balancer;
mod circuit_breaker;
mod context;
mod endpoint;
mod endpoint_cache;
mod endpointer;
mod error;
mod event;
mod factory;
mod gate;
mod instancer;
mod instrument;
mod lookup_service;
mod rate_limit;
mod retry;
mod service_probe;

pub use balancer::*;
pub use circuit_breaker::*;
pub use context::*;
pub use endpoint::*;
pub use endpoint_cache::*;
pub use endpointer::*;
pub use error::*;
pub use event::*;
pub use factory::*;
pub use gate::*;
pub use instancer::*;
pub use instrument::*;
pub use lookup_service::*;
pub use rate_limit::*;
pub use retry::*;
pub use service_probe::*;
