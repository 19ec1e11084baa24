//! Service Discovery and Client-Side Load Balancing for Armature
//!
//! This crate turns logical service names into concrete endpoints and picks
//! one endpoint per request.
//!
//! ## Features
//!
//! - **Endpoint Sets** - Immutable, generation-tagged snapshots of a service
//! - **Resolvers** - One background task per service, polling or watching
//! - **Registry** - Lazily created resolvers with shared balancer cursors
//! - **Load Balancing** - Round-robin, random, least-pending, or custom
//! - **Multiple Backends** - Kubernetes, Consul, DNS, or in-memory
//!
//! ## Quick Start
//!
//! ### In-Memory Discovery (Testing)
//!
//! ```rust,ignore
//! use armature_discovery::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = InMemoryDiscovery::new();
//!     discovery.register("api", Endpoint::new("10.0.0.1", 8080));
//!     discovery.register("api", Endpoint::new("10.0.0.2", 8080));
//!
//!     let registry = ResolverRegistry::new(Arc::new(discovery), RegistryConfig::default());
//!     let set = registry.get("api").await?;
//!
//!     let balancer = LoadBalancingStrategy::RoundRobin.build();
//!     let cursor = registry.cursor("api", balancer.name())?;
//!     println!("Selected: {}", balancer.select(&set, &cursor)?);
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Kubernetes Discovery
//!
//! ```rust,ignore
//! use armature_discovery::*;
//! use std::sync::Arc;
//!
//! let kubernetes = KubernetesDiscovery::in_cluster()?;
//! let registry = ResolverRegistry::new(Arc::new(kubernetes), RegistryConfig::default());
//!
//! // Endpoints of the `hello-node` service, kept current by a watch
//! let set = registry.get("hello-node").await?;
//! ```

pub mod balancer;
pub mod consul;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod kubernetes;
pub mod memory;
pub mod registry;
pub mod resolver;
pub mod source;

pub use balancer::{
    BalancerCursor, First, LeastPending, LoadBalancer, LoadBalancingStrategy, OutcomeKind,
    Random, RoundRobin, SelectionOutcome,
};
pub use consul::ConsulDiscovery;
pub use dns::DnsDiscovery;
pub use endpoint::{Endpoint, EndpointSet};
pub use error::{DiscoveryError, Result};
pub use kubernetes::{KubernetesConfig, KubernetesDiscovery};
pub use memory::InMemoryDiscovery;
pub use registry::{RegistryConfig, RegistryEntry, ResolverRegistry};
pub use resolver::{Resolver, ResolverConfig, ResolverStatus};
pub use source::{DiscoverySource, EndpointUpdates};
