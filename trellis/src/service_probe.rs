//! Provides the builder and implementation of [`PollingInstancer`], an
//! [`Instancer`] fed by periodic lookups.

use crate::{Broadcaster, Event, EventSender, Instancer, LookupService};
use anyhow::Context as _;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

static DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Enumerates the different resolution strategies that
/// the [`PollingInstancerBuilder`] supports.
#[derive(Debug, Clone, Copy)]
pub enum ResolutionStrategy {
    /// Creates the instancer without attempting to resolve
    /// an initial set of instances.
    Lazy,
    /// Tries to resolve the service before creating the instancer
    /// in order to start with a non-empty set of instances.
    Eager { timeout: Duration },
}

/// An [`Instancer`] that periodically asks a [`LookupService`] for the
/// instances of a service and broadcasts the result.
///
/// A failed lookup is published as an error [`Event`], never as an empty
/// service. The probe task stops when the instancer is stopped or dropped.
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use std::collections::HashSet;
/// use trellis::{LookupService, PollingInstancer};
///
/// struct Static;
///
/// #[async_trait::async_trait]
/// impl LookupService for Static {
///     async fn resolve_service_instances(&self) -> Result<HashSet<String>, anyhow::Error> {
///         Ok(HashSet::from(["10.0.0.1:5000".to_string()]))
///     }
/// }
///
/// let instancer = PollingInstancer::builder(Static)
///     .probe_interval(std::time::Duration::from_secs(3))
///     .build()
///     .await
///     .expect("failed to construct PollingInstancer");
/// # drop(instancer);
/// # }
/// ```
#[derive(Debug)]
pub struct PollingInstancer {
    broadcaster: Arc<Broadcaster>,
    shutdown: CancellationToken,
}

impl PollingInstancer {
    /// Start configuring a `PollingInstancer` around `lookup_service`.
    pub fn builder<L>(lookup_service: L) -> PollingInstancerBuilder<L>
    where
        L: LookupService + Send + Sync + 'static,
    {
        PollingInstancerBuilder {
            lookup_service,
            probe_interval: None,
            resolution_strategy: ResolutionStrategy::Lazy,
        }
    }

    /// The most recently published state.
    pub fn state(&self) -> Event {
        self.broadcaster.state()
    }

    /// Stop probing. Subscribers keep the last published state.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Instancer for PollingInstancer {
    fn register(&self, tx: EventSender) {
        self.broadcaster.register(tx)
    }

    fn deregister(&self, tx: &EventSender) {
        self.broadcaster.deregister(tx)
    }
}

impl Drop for PollingInstancer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builder to configure and create a [`PollingInstancer`].
pub struct PollingInstancerBuilder<L> {
    lookup_service: L,
    probe_interval: Option<Duration>,
    resolution_strategy: ResolutionStrategy,
}

impl<L> PollingInstancerBuilder<L>
where
    L: LookupService + Send + Sync + 'static,
{
    /// Set how often the instancer should probe for changes.
    /// Default interval in seconds is 10.
    pub fn probe_interval(self, interval: Duration) -> Self {
        Self {
            probe_interval: Some(interval),
            ..self
        }
    }

    /// Set the [`ResolutionStrategy`].
    ///
    /// Default set to [`ResolutionStrategy::Lazy`].
    ///
    /// If [`ResolutionStrategy::Eager`] is set the service is resolved once
    /// before the [`PollingInstancer`] is created, which ensures that the first
    /// subscriber receives a resolved set of instances. If that fails,
    /// construction fails too.
    pub fn resolution_strategy(self, resolution_strategy: ResolutionStrategy) -> Self {
        Self {
            resolution_strategy,
            ..self
        }
    }

    /// Construct a [`PollingInstancer`] and spawn its probe task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<PollingInstancer, anyhow::Error> {
        let broadcaster = Arc::new(Broadcaster::new());
        let probe = ServiceProbe {
            lookup_service: self.lookup_service,
            broadcaster: Arc::clone(&broadcaster),
            probe_interval: self.probe_interval.unwrap_or(DEFAULT_PROBE_INTERVAL),
        };

        let resolved = if let ResolutionStrategy::Eager { timeout } = self.resolution_strategy {
            // Make sure we resolve the service once before handing out the instancer.
            tokio::time::timeout(timeout, probe.probe_once())
                .await
                .context("timed out while attempting to resolve instances")?
                .context("failed to resolve instances")?;
            true
        } else {
            false
        };

        let shutdown = CancellationToken::new();
        tokio::spawn(
            probe
                .probe(shutdown.clone(), resolved)
                .instrument(tracing::debug_span!("service_probe")),
        );

        Ok(PollingInstancer {
            broadcaster,
            shutdown,
        })
    }
}

struct ServiceProbe<L> {
    lookup_service: L,
    broadcaster: Arc<Broadcaster>,
    probe_interval: Duration,
}

impl<L: LookupService + Send + Sync + 'static> ServiceProbe<L> {
    async fn probe(self, shutdown: CancellationToken, resolved: bool) {
        let mut interval = tokio::time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if resolved {
            // The first tick completes immediately; the eager lookup already covered it.
            interval.tick().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(err) = self.probe_once().await {
                self.broadcaster.update(Event::error(err));
            }
        }

        tracing::debug!("service probe stopped");
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn probe_once(&self) -> Result<(), anyhow::Error> {
        let instances = self
            .lookup_service
            .resolve_service_instances()
            .await
            .context("service lookup failed")?;
        tracing::debug!("resolved {} instance(s)", instances.len());
        self.broadcaster.update(Event::healthy(instances));
        Ok(())
    }
}
