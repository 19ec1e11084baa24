//! Kubernetes discovery source.
//!
//! Reads the `Endpoints` object of a service through the API server and
//! streams its changes with a watch request. Only ready addresses become
//! endpoints.

use crate::endpoint::{Endpoint, metadata};
use crate::error::{DiscoveryError, Result};
use crate::source::{DiscoverySource, EndpointUpdates};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default service-account mount inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const SOURCE: &str = "kubernetes";

/// Kubernetes API access configuration.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// API server base URL, e.g. `https://10.96.0.1:443`
    pub api_server: String,
    /// Namespace the services live in
    pub namespace: String,
    /// Bearer token
    pub token: Option<String>,
    /// PEM bundle used to verify the API server
    pub ca_cert: Option<Vec<u8>>,
    /// Port to pick from each subset; the first port when unset
    pub port_name: Option<String>,
    /// Skip TLS verification of the API server
    pub accept_invalid_certs: bool,
    /// Timeout of list requests
    pub request_timeout: Duration,
    /// Server-side lifetime of a watch request
    pub watch_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            token: None,
            ca_cert: None,
            port_name: None,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(10),
            watch_timeout: Duration::from_secs(300),
        }
    }
}

impl KubernetesConfig {
    /// Create a configuration for an explicit API server.
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Configuration for a process running inside a pod.
    ///
    /// Uses `KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT` and the
    /// token, CA and namespace files of the service-account mount.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            DiscoveryError::InvalidConfiguration("KUBERNETES_SERVICE_HOST is not set".to_string())
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        Self::new(format!("https://{host}:{port}")).with_service_account(SERVICE_ACCOUNT_DIR)
    }

    /// Load token, CA bundle and namespace from a service-account directory.
    /// Missing files are skipped.
    pub fn with_service_account(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let token_path = dir.join("token");
        if token_path.exists() {
            self.token = Some(std::fs::read_to_string(token_path)?.trim().to_string());
        }

        let ca_path = dir.join("ca.crt");
        if ca_path.exists() {
            self.ca_cert = Some(std::fs::read(ca_path)?);
        }

        let ns_path = dir.join("namespace");
        if ns_path.exists() {
            self.namespace = std::fs::read_to_string(ns_path)?.trim().to_string();
        }

        Ok(self)
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Pick the named port from each subset
    pub fn with_port_name(mut self, name: impl Into<String>) -> Self {
        self.port_name = Some(name.into());
        self
    }

    /// Trust any API server certificate
    pub fn accept_invalid_certs(mut self) -> Self {
        self.accept_invalid_certs = true;
        self
    }
}

#[derive(Debug, Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<EndpointAddress>,
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointAddress {
    ip: String,
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    target_ref: Option<ObjectReference>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointPort {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

impl EndpointsObject {
    fn endpoints(&self, port_name: Option<&str>) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();

        for subset in &self.subsets {
            let port = match port_name {
                Some(name) => subset
                    .ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(name)),
                None => subset.ports.first(),
            };
            let Some(port) = port else {
                continue;
            };

            for address in &subset.addresses {
                let mut endpoint =
                    Endpoint::new(&address.ip, port.port).with_metadata(metadata::READY, "true");
                if let Some(pod) = address.target_ref.as_ref().and_then(|r| r.name.as_ref()) {
                    endpoint = endpoint.with_metadata(metadata::POD_NAME, pod);
                }
                if let Some(node) = &address.node_name {
                    endpoint = endpoint.with_metadata(metadata::NODE_NAME, node);
                }
                endpoints.push(endpoint);
            }
        }

        endpoints
    }
}

/// Turn one line of a watch response into an update. Bookmarks and blank
/// lines yield nothing.
fn parse_event(
    line: &[u8],
    service: &str,
    port_name: Option<&str>,
    versions: &DashMap<String, String>,
) -> Option<Result<Vec<Endpoint>>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    let event: WatchEvent = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(e) => return Some(Err(e.into())),
    };
    trace!(service = %service, kind = %event.kind, "Watch event");

    match event.kind.as_str() {
        "ADDED" | "MODIFIED" => {
            let object: EndpointsObject = match serde_json::from_value(event.object) {
                Ok(object) => object,
                Err(e) => return Some(Err(e.into())),
            };
            if let Some(version) = &object.metadata.resource_version {
                versions.insert(service.to_string(), version.clone());
            }
            Some(Ok(object.endpoints(port_name)))
        }
        "DELETED" => {
            versions.remove(service);
            Some(Ok(Vec::new()))
        }
        "ERROR" => {
            let message = event
                .object
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("watch error")
                .to_string();
            // Usually "too old resource version"; relist from scratch
            versions.remove(service);
            Some(Err(DiscoveryError::unavailable(SOURCE, service, message)))
        }
        _ => None,
    }
}

/// Kubernetes `Endpoints` discovery source
pub struct KubernetesDiscovery {
    config: KubernetesConfig,
    client: reqwest::Client,
    versions: Arc<DashMap<String, String>>,
}

impl KubernetesDiscovery {
    /// Create a discovery source from a configuration.
    pub fn new(config: KubernetesConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(pem) = &config.ca_cert {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            config,
            versions: Arc::new(DashMap::new()),
        })
    }

    /// Discovery source for a process running inside a pod.
    pub fn in_cluster() -> Result<Self> {
        Self::new(KubernetesConfig::in_cluster()?)
    }

    /// Configuration in use.
    pub fn config(&self) -> &KubernetesConfig {
        &self.config
    }

    fn endpoints_url(&self, service: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/endpoints/{}",
            self.config.api_server, self.config.namespace, service
        )
    }

    fn watch_url(&self, service: &str) -> String {
        let mut url = format!(
            "{}/api/v1/namespaces/{}/endpoints?watch=true&fieldSelector=metadata.name%3D{}&timeoutSeconds={}",
            self.config.api_server,
            self.config.namespace,
            service,
            self.config.watch_timeout.as_secs()
        );
        if let Some(version) = self.versions.get(service) {
            url.push_str("&resourceVersion=");
            url.push_str(version.value());
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl DiscoverySource for KubernetesDiscovery {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn list(&self, service: &str) -> Result<Vec<Endpoint>> {
        let response = self
            .authorize(self.client.get(self.endpoints_url(service)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| DiscoveryError::unavailable(SOURCE, service, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(service = %service, namespace = %self.config.namespace, "No Endpoints object");
            self.versions.remove(service);
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::unavailable(
                SOURCE,
                service,
                format!("HTTP {status}: {body}"),
            ));
        }

        let object: EndpointsObject = response.json().await?;
        if let Some(version) = &object.metadata.resource_version {
            self.versions.insert(service.to_string(), version.clone());
        }

        let endpoints = object.endpoints(self.config.port_name.as_deref());
        debug!(
            service = %service,
            namespace = %self.config.namespace,
            count = endpoints.len(),
            "Listed Kubernetes endpoints"
        );
        Ok(endpoints)
    }

    async fn watch(&self, service: &str) -> Result<Option<EndpointUpdates>> {
        let response = self
            .authorize(self.client.get(self.watch_url(service)))
            .send()
            .await
            .map_err(|e| DiscoveryError::unavailable(SOURCE, service, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::unavailable(
                SOURCE,
                service,
                format!("watch rejected with HTTP {status}"),
            ));
        }

        let (tx, rx) = mpsc::channel(16);
        let service = service.to_string();
        let port_name = self.config.port_name.clone();
        let versions = self.versions.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(service = %service, error = %e, "Watch stream failed");
                        let _ = tx
                            .send(Err(DiscoveryError::unavailable(SOURCE, &service, e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Some(update) = parse_event(&line, &service, port_name.as_deref(), &versions)
                        && tx.send(update).await.is_err()
                    {
                        return;
                    }
                }
            }

            if let Some(update) = parse_event(&buffer, &service, port_name.as_deref(), &versions) {
                let _ = tx.send(update).await;
            }
            debug!(service = %service, "Watch stream ended");
        });

        Ok(Some(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hello_node(version: &str) -> serde_json::Value {
        serde_json::json!({
            "kind": "Endpoints",
            "metadata": {"name": "hello-node", "resourceVersion": version},
            "subsets": [{
                "addresses": [
                    {"ip": "10.1.0.5", "nodeName": "node-a",
                     "targetRef": {"kind": "Pod", "name": "hello-node-7d9f"}},
                    {"ip": "10.1.0.6", "nodeName": "node-b",
                     "targetRef": {"kind": "Pod", "name": "hello-node-x2k1"}}
                ],
                "notReadyAddresses": [{"ip": "10.1.0.7"}],
                "ports": [
                    {"name": "metrics", "port": 9090, "protocol": "TCP"},
                    {"name": "http", "port": 8080, "protocol": "TCP"}
                ]
            }]
        })
    }

    fn discovery(server: &MockServer) -> KubernetesDiscovery {
        KubernetesDiscovery::new(
            KubernetesConfig::new(server.uri())
                .with_token("secret")
                .with_port_name("http"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lists_ready_addresses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/endpoints/hello-node"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hello_node("100")))
            .mount(&server)
            .await;

        let source = discovery(&server);
        let endpoints = source.list("hello-node").await.unwrap();

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].authority(), "10.1.0.5:8080");
        assert_eq!(endpoints[0].metadata(metadata::POD_NAME), Some("hello-node-7d9f"));
        assert_eq!(endpoints[1].metadata(metadata::NODE_NAME), Some("node-b"));
        assert!(source.watch_url("hello-node").ends_with("&resourceVersion=100"));
    }

    #[tokio::test]
    async fn test_first_port_without_port_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hello_node("1")))
            .mount(&server)
            .await;

        let source = KubernetesDiscovery::new(KubernetesConfig::new(server.uri())).unwrap();
        let endpoints = source.list("hello-node").await.unwrap();
        assert_eq!(endpoints[0].port, 9090);
    }

    #[tokio::test]
    async fn test_missing_endpoints_object_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let endpoints = discovery(&server).list("hello-node").await.unwrap();
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("endpoints is forbidden"))
            .mount(&server)
            .await;

        let err = discovery(&server).list("hello-node").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_watch_streams_events() {
        let server = MockServer::start().await;
        let events = [
            serde_json::json!({"type": "ADDED", "object": hello_node("101")}).to_string(),
            serde_json::json!({"type": "BOOKMARK", "object": {"metadata": {"resourceVersion": "102"}}})
                .to_string(),
            serde_json::json!({"type": "DELETED", "object": hello_node("103")}).to_string(),
        ]
        .join("\n");

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/endpoints"))
            .and(query_param("watch", "true"))
            .and(query_param("fieldSelector", "metadata.name=hello-node"))
            .respond_with(ResponseTemplate::new(200).set_body_string(events))
            .mount(&server)
            .await;

        let source = discovery(&server);
        let mut updates = source.watch("hello-node").await.unwrap().unwrap();

        let added = updates.recv().await.unwrap().unwrap();
        assert_eq!(added.len(), 2);

        let deleted = updates.recv().await.unwrap().unwrap();
        assert!(deleted.is_empty());

        assert!(updates.recv().await.is_none());
    }

    #[test]
    fn test_parse_error_event() {
        let versions = DashMap::new();
        versions.insert("api".to_string(), "5".to_string());

        let line = br#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version"}}"#;
        let update = parse_event(line, "api", None, &versions).unwrap();

        assert!(update.unwrap_err().to_string().contains("too old"));
        assert!(versions.is_empty());
    }

    #[test]
    fn test_service_account_files() {
        let dir = std::env::temp_dir().join(format!("armature-sa-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("token"), "abc\n").unwrap();
        std::fs::write(dir.join("namespace"), "shop\n").unwrap();

        let config = KubernetesConfig::new("https://10.96.0.1:443/")
            .with_service_account(&dir)
            .unwrap();

        assert_eq!(config.api_server, "https://10.96.0.1:443");
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.namespace, "shop");
        assert!(config.ca_cert.is_none());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
