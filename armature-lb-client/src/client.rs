//! Load-balanced HTTP client.

use crate::dispatcher::Dispatcher;
use crate::outlier::OutlierDetector;
use crate::request::{RequestBuilder, RequestSpec};
use crate::transport::{ReqwestTransport, Transport};
use crate::{ClientConfig, HttpClientError, Response, Result};
use armature_discovery::{
    DiscoverySource, EndpointSet, LoadBalancer, LoadBalancingStrategy, ResolverRegistry,
    ResolverStatus,
};
use dashmap::DashMap;
use http::Method;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Observable state of one service, as seen by the client.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Resolver state
    pub resolver: ResolverStatus,
    /// Strategy in use for the service
    pub strategy: String,
    /// Endpoints currently ejected by outlier detection
    pub ejected: Vec<String>,
}

struct ClientInner {
    config: ClientConfig,
    registry: Arc<ResolverRegistry>,
    dispatcher: Dispatcher,
    default_balancer: Arc<dyn LoadBalancer>,
    balancers: DashMap<String, Arc<dyn LoadBalancer>>,
    shut_down: AtomicBool,
}

/// HTTP client addressing logical services instead of hosts.
///
/// Each client owns its resolvers; nothing is shared between clients.
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct LoadBalancedClient {
    inner: Arc<ClientInner>,
}

impl LoadBalancedClient {
    /// Create a client sending over HTTP with `reqwest`.
    pub fn new(source: Arc<dyn DiscoverySource>, config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(source, transport, config))
    }

    /// Create a client with a custom transport.
    pub fn with_transport(
        source: Arc<dyn DiscoverySource>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        let registry = ResolverRegistry::new(source, config.registry.clone());
        let outlier = config
            .outlier
            .as_ref()
            .map(|outlier| Arc::new(OutlierDetector::new(outlier.clone())));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            transport,
            config.retry.clone(),
            outlier,
        );

        info!(
            source = %registry.source_name(),
            strategy = ?config.strategy,
            "Created load-balanced client"
        );

        Self {
            inner: Arc::new(ClientInner {
                default_balancer: config.strategy.build(),
                config,
                registry,
                dispatcher,
                balancers: DashMap::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get the resolver registry.
    pub fn registry(&self) -> &Arc<ResolverRegistry> {
        &self.inner.registry
    }

    /// Send a request to one endpoint of `service`.
    pub async fn request(&self, service: &str, request: RequestSpec) -> Result<Response> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(HttpClientError::Shutdown);
        }
        let balancer = self.balancer(service);
        self.inner
            .dispatcher
            .dispatch(service, balancer.as_ref(), &request)
            .await
    }

    /// Create a request builder with a custom method.
    pub fn builder(
        &self,
        method: Method,
        service: impl Into<String>,
        path: impl Into<String>,
    ) -> RequestBuilder<'_> {
        RequestBuilder::new(self, service, method, path)
    }

    /// Create a GET request builder.
    pub fn get(&self, service: impl Into<String>, path: impl Into<String>) -> RequestBuilder<'_> {
        self.builder(Method::GET, service, path)
    }

    /// Create a POST request builder.
    pub fn post(&self, service: impl Into<String>, path: impl Into<String>) -> RequestBuilder<'_> {
        self.builder(Method::POST, service, path)
    }

    /// Create a PUT request builder.
    pub fn put(&self, service: impl Into<String>, path: impl Into<String>) -> RequestBuilder<'_> {
        self.builder(Method::PUT, service, path)
    }

    /// Create a PATCH request builder.
    pub fn patch(&self, service: impl Into<String>, path: impl Into<String>) -> RequestBuilder<'_> {
        self.builder(Method::PATCH, service, path)
    }

    /// Create a DELETE request builder.
    pub fn delete(&self, service: impl Into<String>, path: impl Into<String>) -> RequestBuilder<'_> {
        self.builder(Method::DELETE, service, path)
    }

    /// Create a HEAD request builder.
    pub fn head(&self, service: impl Into<String>, path: impl Into<String>) -> RequestBuilder<'_> {
        self.builder(Method::HEAD, service, path)
    }

    /// Current endpoint set of `service`, resolving it if needed.
    pub async fn resolve(&self, service: &str) -> Result<Arc<EndpointSet>> {
        Ok(self.inner.registry.get(service).await?)
    }

    /// Use `strategy` for `service` from now on.
    pub fn set_strategy(&self, service: impl Into<String>, strategy: LoadBalancingStrategy) {
        self.set_balancer(service, strategy.build());
    }

    /// Use a custom balancer for `service` from now on.
    pub fn set_balancer(&self, service: impl Into<String>, balancer: Arc<dyn LoadBalancer>) {
        let service = service.into();
        debug!(service = %service, strategy = %balancer.name(), "Setting load balancer");
        self.inner.balancers.insert(service, balancer);
    }

    /// Balancer in use for `service`.
    pub fn balancer(&self, service: &str) -> Arc<dyn LoadBalancer> {
        self.inner
            .balancers
            .get(service)
            .map(|b| b.value().clone())
            .unwrap_or_else(|| self.inner.default_balancer.clone())
    }

    /// Status of `service`, if it was used.
    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        let resolver = self.inner.registry.status(service)?;
        Some(self.service_status(resolver))
    }

    /// Status of every service used so far.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.inner
            .registry
            .statuses()
            .into_iter()
            .map(|resolver| self.service_status(resolver))
            .collect()
    }

    fn service_status(&self, resolver: ResolverStatus) -> ServiceStatus {
        let ejected = match self.inner.dispatcher.outlier() {
            Some(outlier) => resolver
                .endpoints
                .iter()
                .filter(|e| outlier.is_ejected(&resolver.service, e))
                .map(|e| e.authority())
                .collect(),
            None => Vec::new(),
        };
        ServiceStatus {
            strategy: self.balancer(&resolver.service).name().to_string(),
            ejected,
            resolver,
        }
    }

    /// Stop all resolvers. Requests issued afterwards fail with `Shutdown`.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down load-balanced client");
        self.inner.registry.shutdown();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoadBalancedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancedClient")
            .field("registry", &self.inner.registry)
            .field("strategy", &self.inner.default_balancer.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armature_discovery::{Endpoint, InMemoryDiscovery};

    fn discovery() -> Arc<InMemoryDiscovery> {
        let discovery = InMemoryDiscovery::new();
        discovery.set_endpoints("api", vec![Endpoint::new("10.0.0.1", 80)]);
        Arc::new(discovery)
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = LoadBalancedClient::new(discovery(), ClientConfig::default()).unwrap();
        assert!(client.config().gzip);
        assert_eq!(client.balancer("api").name(), "round_robin");
        assert!(client.status("api").is_none());
    }

    #[tokio::test]
    async fn test_set_strategy() {
        let client = LoadBalancedClient::new(discovery(), ClientConfig::default()).unwrap();
        client.set_strategy("api", LoadBalancingStrategy::Random);

        assert_eq!(client.balancer("api").name(), "random");
        assert_eq!(client.balancer("other").name(), "round_robin");
    }

    #[tokio::test]
    async fn test_status_after_resolve() {
        let client = LoadBalancedClient::new(discovery(), ClientConfig::default()).unwrap();
        client.resolve("api").await.unwrap();

        let status = client.status("api").unwrap();
        assert_eq!(status.resolver.endpoints.len(), 1);
        assert_eq!(status.strategy, "round_robin");
        assert!(status.ejected.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let client = LoadBalancedClient::new(discovery(), ClientConfig::default()).unwrap();
        client.shutdown();

        let err = client.get("api", "/").send().await.unwrap_err();
        assert!(matches!(err, HttpClientError::Shutdown));
        assert!(client.is_shut_down());
    }
}
