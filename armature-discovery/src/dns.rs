//! DNS discovery source.
//!
//! Treats the logical service name as a host name (optionally `host:port`)
//! and returns every address it resolves to. Headless Kubernetes services
//! and round-robin DNS records both fit this model.

use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, Result};
use crate::source::DiscoverySource;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::debug;

/// DNS discovery source
#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    default_port: u16,
    domain_suffix: Option<String>,
}

impl DnsDiscovery {
    /// Resolve service names, using `default_port` when the name has none.
    pub fn new(default_port: u16) -> Self {
        Self {
            default_port,
            domain_suffix: None,
        }
    }

    /// Append a domain to bare service names, e.g. `svc.cluster.local`.
    pub fn with_domain_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.domain_suffix = Some(suffix.into().trim_start_matches('.').to_string());
        self
    }

    fn target(&self, service: &str) -> (String, u16) {
        let (host, port) = match service.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (service, self.default_port),
            },
            _ => (service, self.default_port),
        };

        let host = match &self.domain_suffix {
            Some(suffix) if !host.contains('.') => format!("{host}.{suffix}"),
            _ => host.to_string(),
        };
        (host, port)
    }
}

#[async_trait]
impl DiscoverySource for DnsDiscovery {
    fn name(&self) -> &str {
        "dns"
    }

    async fn list(&self, service: &str) -> Result<Vec<Endpoint>> {
        let (host, port) = self.target(service);

        let addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| DiscoveryError::unavailable("dns", service, e.to_string()))?;

        // Sorted so that an unchanged record set compares equal
        let unique: BTreeSet<_> = addrs.collect();
        let endpoints: Vec<Endpoint> = unique.into_iter().map(Endpoint::from).collect();

        debug!(service = %service, host = %host, count = endpoints.len(), "Resolved DNS endpoints");
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        let dns = DnsDiscovery::new(80);
        assert_eq!(dns.target("api"), ("api".to_string(), 80));
        assert_eq!(dns.target("api:8080"), ("api".to_string(), 8080));

        let dns = dns.with_domain_suffix(".default.svc.cluster.local");
        assert_eq!(
            dns.target("api:9000"),
            ("api.default.svc.cluster.local".to_string(), 9000)
        );
        assert_eq!(dns.target("api.example.com"), ("api.example.com".to_string(), 80));
    }

    #[tokio::test]
    async fn test_resolves_localhost() {
        let dns = DnsDiscovery::new(8080);
        let endpoints = dns.list("127.0.0.1").await.unwrap();

        assert_eq!(endpoints, vec![Endpoint::new("127.0.0.1", 8080)]);
    }
}
