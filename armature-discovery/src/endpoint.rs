//! Endpoints and immutable endpoint set snapshots.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Well-known metadata keys.
pub mod metadata {
    /// Pod (or instance) name backing the endpoint.
    pub const POD_NAME: &str = "pod";
    /// Node the endpoint is scheduled on.
    pub const NODE_NAME: &str = "node";
    /// Readiness label.
    pub const READY: &str = "ready";
    /// Backend-specific instance ID.
    pub const INSTANCE_ID: &str = "instance-id";
}

/// A concrete routable address implementing a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,

    /// Port number
    pub port: u16,

    /// Metadata (pod name, node, readiness, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata value
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// `host:port`, with IPv6 hosts bracketed. Used as the endpoint's identity.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Base URL for the given scheme, e.g. `http://10.0.0.7:8080`.
    pub fn base_url(&self, scheme: &str) -> String {
        format!("{}://{}", scheme, self.authority())
    }

    /// Socket address, when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Immutable snapshot of the endpoints of one logical service.
///
/// A new generation is published for every change; a set is never modified
/// after construction, so holders can read it without synchronization.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    service: String,
    generation: u64,
    endpoints: Vec<Endpoint>,
    resolved_at: Instant,
}

impl EndpointSet {
    /// Create a snapshot.
    pub fn new(service: impl Into<String>, generation: u64, endpoints: Vec<Endpoint>) -> Self {
        Self {
            service: service.into(),
            generation,
            endpoints,
            resolved_at: Instant::now(),
        }
    }

    /// Logical service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Generation number, strictly increasing per service.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Endpoints in resolution order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoint at `index`.
    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    /// Iterate the endpoints.
    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.endpoints.iter()
    }

    /// When this generation was created.
    pub fn resolved_at(&self) -> Instant {
        self.resolved_at
    }

    /// Age of this generation.
    pub fn age(&self) -> Duration {
        self.resolved_at.elapsed()
    }

    /// Whether `endpoints` has exactly the same members in the same order.
    pub fn same_endpoints(&self, endpoints: &[Endpoint]) -> bool {
        self.endpoints == endpoints
    }

    /// A view of this generation without the endpoints whose authority is in
    /// `excluded`. The generation number is kept.
    pub fn excluding(&self, excluded: &HashSet<String>) -> EndpointSet {
        Self {
            service: self.service.clone(),
            generation: self.generation,
            endpoints: self
                .endpoints
                .iter()
                .filter(|e| !excluded.contains(&e.authority()))
                .cloned()
                .collect(),
            resolved_at: self.resolved_at,
        }
    }
}

impl<'a> IntoIterator for &'a EndpointSet {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_authority() {
        let endpoint = Endpoint::new("10.0.0.7", 8080).with_metadata(metadata::POD_NAME, "hello-1");

        assert_eq!(endpoint.authority(), "10.0.0.7:8080");
        assert_eq!(endpoint.base_url("http"), "http://10.0.0.7:8080");
        assert_eq!(endpoint.metadata(metadata::POD_NAME), Some("hello-1"));
        assert!(endpoint.socket_addr().is_some());
    }

    #[test]
    fn test_ipv6_authority_is_bracketed() {
        let endpoint = Endpoint::new("fd00::1", 80);
        assert_eq!(endpoint.authority(), "[fd00::1]:80");
    }

    #[test]
    fn test_hostname_has_no_socket_addr() {
        let endpoint = Endpoint::new("hello-node.default.svc", 80);
        assert_eq!(endpoint.authority(), "hello-node.default.svc:80");
        assert!(endpoint.socket_addr().is_none());
    }

    #[test]
    fn test_excluding_keeps_generation() {
        let set = EndpointSet::new(
            "hello-node",
            4,
            vec![Endpoint::new("a", 80), Endpoint::new("b", 80), Endpoint::new("c", 80)],
        );
        let excluded: HashSet<String> = ["b:80".to_string()].into_iter().collect();

        let view = set.excluding(&excluded);
        assert_eq!(view.generation(), 4);
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1).map(|e| e.host.as_str()), Some("c"));
        // The original snapshot is untouched
        assert_eq!(set.len(), 3);
    }
}
