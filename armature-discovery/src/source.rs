//! Discovery source abstraction.

use crate::endpoint::Endpoint;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Stream of endpoint lists pushed by a watching source.
///
/// Each item is the complete current membership, not a delta. The resolver
/// falls back to polling when the channel closes.
pub type EndpointUpdates = mpsc::Receiver<Result<Vec<Endpoint>>>;

/// A discovery backend (Kubernetes, Consul, DNS, in-memory, ...).
///
/// `Ok(vec![])` from [`list`](DiscoverySource::list) means the backend
/// authoritatively reports no healthy endpoints. Any `Err` means the answer
/// is unknown right now and the caller keeps its last known set.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// List the current endpoints of a service.
    async fn list(&self, service: &str) -> Result<Vec<Endpoint>>;

    /// Subscribe to pushed updates for a service.
    ///
    /// Returns `Ok(None)` when the source only supports polling.
    async fn watch(&self, service: &str) -> Result<Option<EndpointUpdates>> {
        let _ = service;
        Ok(None)
    }
}
