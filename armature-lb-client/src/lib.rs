//! # Armature Load-Balanced Client
//!
//! An HTTP client that addresses logical services instead of hosts. Each
//! request is resolved through service discovery, sent to one endpoint chosen
//! by a load balancing strategy, and retried on other endpoints when that
//! endpoint is unreachable.
//!
//! ## Features
//!
//! - **Service Discovery**: Kubernetes, Consul, DNS, or in-memory sources
//! - **Load Balancing**: Round-robin, random, least-pending, or custom
//! - **Retry Elsewhere**: Failed endpoints are excluded for the rest of the request
//! - **Backoff**: Exponential, linear, constant, or none between attempts
//! - **Outlier Detection**: Repeatedly failing endpoints are ejected for a while
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use armature_lb_client::{ClientConfig, LoadBalancedClient};
//! use armature_lb_client::discovery::KubernetesDiscovery;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Arc::new(KubernetesDiscovery::in_cluster()?);
//!     let client = LoadBalancedClient::new(discovery, ClientConfig::default())?;
//!
//!     let response = client.get("hello-node", "/").send().await?;
//!
//!     println!("Response of pod {}: {}", response.endpoint(), response.text()?);
//!     Ok(())
//! }
//! ```
//!
//! ## With Retry and Outlier Detection
//!
//! ```rust,no_run
//! use armature_lb_client::{ClientConfig, LoadBalancedClient, OutlierConfig, RetryConfig};
//! use armature_lb_client::discovery::{InMemoryDiscovery, LoadBalancingStrategy, Endpoint};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = InMemoryDiscovery::new();
//!     discovery.register("orders", Endpoint::new("10.0.0.1", 8080));
//!     discovery.register("orders", Endpoint::new("10.0.0.2", 8080));
//!
//!     let config = ClientConfig::builder()
//!         .timeout(Duration::from_secs(5))
//!         .retry(RetryConfig::exponential(3, Duration::from_millis(50)))
//!         .outlier(OutlierConfig::default())
//!         .strategy(LoadBalancingStrategy::LeastPending)
//!         .build();
//!
//!     let client = LoadBalancedClient::new(Arc::new(discovery), config)?;
//!
//!     let response = client
//!         .post("orders", "/orders")
//!         .json(&serde_json::json!({"item": "widget", "quantity": 5}))
//!         .send()
//!         .await?;
//!
//!     println!("Served by {} after {} attempt(s)", response.endpoint(), response.attempts());
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod dispatcher;
mod error;
mod outlier;
mod request;
mod response;
mod retry;
mod transport;

pub use client::{LoadBalancedClient, ServiceStatus};
pub use config::{ClientConfig, ClientConfigBuilder, ENV_PREFIX};
pub use dispatcher::{DispatchState, Dispatcher};
pub use error::{HttpClientError, Result};
pub use outlier::{EndpointState, OutlierConfig, OutlierDetector};
pub use request::{RequestBuilder, RequestSpec};
pub use response::Response;
pub use retry::{BackoffStrategy, RetryConfig, RetryStrategy};
pub use transport::{ReqwestTransport, Transport, TransportError};

/// Service discovery types.
pub use armature_discovery as discovery;

// Re-export common types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
pub use url::Url;

/// Prelude for common imports.
///
/// ```
/// use armature_lb_client::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::{LoadBalancedClient, ServiceStatus};
    pub use crate::config::{ClientConfig, ClientConfigBuilder};
    pub use crate::error::{HttpClientError, Result};
    pub use crate::outlier::{OutlierConfig, OutlierDetector};
    pub use crate::request::{RequestBuilder, RequestSpec};
    pub use crate::response::Response;
    pub use crate::retry::{BackoffStrategy, RetryConfig, RetryStrategy};
    pub use crate::transport::{ReqwestTransport, Transport, TransportError};
    pub use armature_discovery::{
        DiscoverySource, Endpoint, EndpointSet, InMemoryDiscovery, KubernetesDiscovery,
        LoadBalancer, LoadBalancingStrategy,
    };
    pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
}
