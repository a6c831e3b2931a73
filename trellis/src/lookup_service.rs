//! Defines the interface that [`PollingInstancer`](crate::PollingInstancer) requires in order
//! to resolve the instances of a service.

use std::collections::HashSet;

/// Interface that provides functionality to
/// acquire the current instance addresses of a service.
///
/// Addresses are usually `host:port` (`[host]:port` for IPv6), but any token
/// that is stable for an unchanged instance works.
#[async_trait::async_trait]
pub trait LookupService {
    /// Return the unique instance addresses currently backing the service.
    /// If no instances were found, an empty HashSet is returned.
    ///
    /// An `Err` means the lookup itself failed; it is reported downstream as a
    /// discovery error rather than as an empty service.
    async fn resolve_service_instances(&self) -> Result<HashSet<String>, anyhow::Error>;
}
