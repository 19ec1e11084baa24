//! In-memory discovery source (static configurations and tests)

use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, Result};
use crate::source::{DiscoverySource, EndpointUpdates};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

type Watchers = HashMap<String, Vec<mpsc::Sender<Result<Vec<Endpoint>>>>>;

/// In-memory discovery source.
///
/// Cloning shares the underlying state, so a test can keep a handle and
/// change membership while a resolver polls or watches it.
#[derive(Clone, Default)]
pub struct InMemoryDiscovery {
    services: Arc<RwLock<HashMap<String, Vec<Endpoint>>>>,
    failure: Arc<RwLock<Option<String>>>,
    watchers: Arc<RwLock<Watchers>>,
    list_calls: Arc<AtomicUsize>,
    latency: Option<Duration>,
    supports_watch: bool,
}

impl InMemoryDiscovery {
    /// Create new in-memory discovery
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `list` call (to exercise concurrent callers).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Push membership changes to watchers instead of relying on polling.
    pub fn with_watch(mut self) -> Self {
        self.supports_watch = true;
        self
    }

    /// Replace the endpoints of a service. An empty vector marks the service
    /// as authoritatively empty.
    pub fn set_endpoints(&self, service: &str, endpoints: Vec<Endpoint>) {
        debug!(service = %service, count = endpoints.len(), "Setting in-memory endpoints");
        self.services
            .write()
            .insert(service.to_string(), endpoints.clone());
        self.notify(service, endpoints);
    }

    /// Add one endpoint to a service.
    pub fn register(&self, service: &str, endpoint: Endpoint) {
        let endpoints = {
            let mut services = self.services.write();
            let entry = services.entry(service.to_string()).or_default();
            entry.push(endpoint);
            entry.clone()
        };
        self.notify(service, endpoints);
    }

    /// Remove an endpoint (by authority) from a service.
    pub fn deregister(&self, service: &str, authority: &str) -> Result<()> {
        let endpoints = {
            let mut services = self.services.write();
            let entry = services
                .get_mut(service)
                .ok_or_else(|| {
                    DiscoveryError::InvalidConfiguration(format!("{service} is not registered"))
                })?;
            let before = entry.len();
            entry.retain(|e| e.authority() != authority);
            if entry.len() == before {
                return Err(DiscoveryError::InvalidConfiguration(format!(
                    "{authority} is not registered for {service}"
                )));
            }
            entry.clone()
        };
        self.notify(service, endpoints);
        Ok(())
    }

    /// Forget a service entirely; lookups fail until it is set again.
    pub fn remove_service(&self, service: &str) {
        self.services.write().remove(service);
    }

    /// Make every `list` call fail with `message` until [`recover`](Self::recover).
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    /// Stop injecting failures.
    pub fn recover(&self) {
        *self.failure.write() = None;
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Clear all registered services
    pub fn clear(&self) {
        self.services.write().clear();
    }

    fn notify(&self, service: &str, endpoints: Vec<Endpoint>) {
        let mut watchers = self.watchers.write();
        if let Some(senders) = watchers.get_mut(service) {
            senders.retain(|tx| tx.try_send(Ok(endpoints.clone())).is_ok());
        }
    }
}

#[async_trait]
impl DiscoverySource for InMemoryDiscovery {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, service: &str) -> Result<Vec<Endpoint>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self.failure.read().clone() {
            return Err(DiscoveryError::unavailable("memory", service, message));
        }

        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| DiscoveryError::unavailable("memory", service, "service not registered"))
    }

    async fn watch(&self, service: &str) -> Result<Option<EndpointUpdates>> {
        if !self.supports_watch {
            return Ok(None);
        }

        let (tx, rx) = mpsc::channel(16);
        self.watchers
            .write()
            .entry(service.to_string())
            .or_default()
            .push(tx);
        Ok(Some(rx))
    }
}
