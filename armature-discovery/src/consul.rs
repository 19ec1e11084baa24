//! Consul discovery source
//!
//! Lists the instances of a service that pass their health checks, using
//! Consul's health endpoint.

use crate::endpoint::{Endpoint, metadata};
use crate::error::{DiscoveryError, Result};
use crate::source::DiscoverySource;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: NodeDetail,
    #[serde(rename = "Service")]
    service: ServiceDetail,
}

#[derive(Debug, Deserialize)]
struct NodeDetail {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ServiceDetail {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
}

impl HealthEntry {
    fn into_endpoint(self) -> Endpoint {
        // An empty service address means "same as the node"
        let host = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };

        let mut endpoint = Endpoint::new(host, self.service.port)
            .with_metadata(metadata::INSTANCE_ID, self.service.id)
            .with_metadata(metadata::NODE_NAME, self.node.node);

        if let Some(tags) = self.service.tags.filter(|t| !t.is_empty()) {
            endpoint = endpoint.with_metadata("tags", tags.join(","));
        }
        for (key, value) in self.service.meta.unwrap_or_default() {
            endpoint = endpoint.with_metadata(key, value);
        }
        endpoint
    }
}

/// Consul discovery source
pub struct ConsulDiscovery {
    base_url: String,
    datacenter: Option<String>,
    client: reqwest::Client,
}

impl ConsulDiscovery {
    /// Create a new Consul discovery source
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use armature_discovery::ConsulDiscovery;
    ///
    /// let consul = ConsulDiscovery::new("http://localhost:8500")?;
    /// ```
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            datacenter: None,
            client,
        })
    }

    /// Query a specific datacenter instead of the agent's own.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    fn health_url(&self, service: &str) -> String {
        let mut url = format!("{}/v1/health/service/{}?passing=true", self.base_url, service);
        if let Some(dc) = &self.datacenter {
            url.push_str("&dc=");
            url.push_str(dc);
        }
        url
    }
}

#[async_trait]
impl DiscoverySource for ConsulDiscovery {
    fn name(&self) -> &str {
        "consul"
    }

    async fn list(&self, service: &str) -> Result<Vec<Endpoint>> {
        let response = self
            .client
            .get(self.health_url(service))
            .send()
            .await
            .map_err(|e| DiscoveryError::unavailable("consul", service, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::unavailable(
                "consul",
                service,
                format!("HTTP {status}: {body}"),
            ));
        }

        let entries: Vec<HealthEntry> = response.json().await?;
        let endpoints: Vec<Endpoint> = entries.into_iter().map(HealthEntry::into_endpoint).collect();

        debug!(
            service = %service,
            count = endpoints.len(),
            "Discovered passing Consul instances"
        );
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_consul_discovery_creation() {
        let consul = ConsulDiscovery::new("http://localhost:8500/").unwrap();
        assert_eq!(
            consul.health_url("api"),
            "http://localhost:8500/v1/health/service/api?passing=true"
        );

        let consul = consul.with_datacenter("eu-west");
        assert!(consul.health_url("api").ends_with("&dc=eu-west"));
    }

    #[tokio::test]
    async fn test_lists_passing_instances() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .and(query_param("passing", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "Node": {"Node": "node-1", "Address": "10.0.0.1"},
                    "Service": {"ID": "api-1", "Service": "api", "Address": "", "Port": 8080,
                                "Tags": ["v1"], "Meta": {"zone": "a"}}
                },
                {
                    "Node": {"Node": "node-2", "Address": "10.0.0.2"},
                    "Service": {"ID": "api-2", "Service": "api", "Address": "10.1.0.2", "Port": 8080,
                                "Tags": null, "Meta": null}
                }
            ])))
            .mount(&server)
            .await;

        let consul = ConsulDiscovery::new(server.uri()).unwrap();
        let endpoints = consul.list("api").await.unwrap();

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].authority(), "10.0.0.1:8080");
        assert_eq!(endpoints[0].metadata(metadata::INSTANCE_ID), Some("api-1"));
        assert_eq!(endpoints[0].metadata("tags"), Some("v1"));
        assert_eq!(endpoints[0].metadata("zone"), Some("a"));
        assert_eq!(endpoints[1].authority(), "10.1.0.2:8080");
        assert_eq!(endpoints[1].metadata(metadata::NODE_NAME), Some("node-2"));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("leader lost"))
            .mount(&server)
            .await;

        let consul = ConsulDiscovery::new(server.uri()).unwrap();
        let err = consul.list("api").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("leader lost"));
    }
}
