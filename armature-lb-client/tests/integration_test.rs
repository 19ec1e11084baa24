//! Integration tests for armature-lb-client

use armature_lb_client::discovery::{
    Endpoint, InMemoryDiscovery, KubernetesConfig, KubernetesDiscovery, LoadBalancingStrategy,
};
use armature_lb_client::*;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend(name: &str, status: u16, expected: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(status).set_body_string(name))
        .expect(expected)
        .mount(&server)
        .await;
    server
}

fn endpoint(server: &MockServer) -> Endpoint {
    Endpoint::from(*server.address())
}

fn client(discovery: &InMemoryDiscovery, config: ClientConfig) -> LoadBalancedClient {
    LoadBalancedClient::new(Arc::new(discovery.clone()), config).unwrap()
}

fn no_backoff() -> ClientConfig {
    ClientConfig::builder()
        .retry(RetryConfig::immediate(3))
        .timeout(Duration::from_secs(2))
        .build()
}

#[tokio::test]
async fn test_hello_node_round_robin() {
    let a = backend("A", 200, 2).await;
    let b = backend("B", 200, 1).await;
    let c = backend("C", 200, 1).await;

    let discovery = InMemoryDiscovery::new();
    discovery.set_endpoints("hello-node", vec![endpoint(&a), endpoint(&b), endpoint(&c)]);
    let client = client(&discovery, no_backoff());

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let response = client.get("hello-node", "/").send().await.unwrap();
        bodies.push(response.text().unwrap());
    }

    assert_eq!(bodies, vec!["A", "B", "C", "A"]);
}

#[tokio::test]
async fn test_concurrent_requests_spread_evenly() {
    let a = backend("A", 200, 10).await;
    let b = backend("B", 200, 10).await;
    let c = backend("C", 200, 10).await;

    let discovery = InMemoryDiscovery::new();
    discovery.set_endpoints("hello-node", vec![endpoint(&a), endpoint(&b), endpoint(&c)]);
    let client = client(&discovery, no_backoff());
    client.resolve("hello-node").await.unwrap();

    let responses = join_all((0..30).map(|_| client.get("hello-node", "/").send())).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for response in responses {
        *counts.entry(response.unwrap().text().unwrap()).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 10));
    assert_eq!(discovery.list_calls(), 1);
}

#[tokio::test]
async fn test_failing_endpoints_are_skipped() {
    let a = backend("A", 503, 1).await;
    let b = backend("B", 502, 1).await;
    let c = backend("C", 200, 1).await;

    let discovery = InMemoryDiscovery::new();
    discovery.set_endpoints("api", vec![endpoint(&a), endpoint(&b), endpoint(&c)]);
    let client = client(&discovery, no_backoff());
    client.set_strategy("api", LoadBalancingStrategy::First);

    let response = client.get("api", "/").send().await.unwrap();

    assert_eq!(response.text().unwrap(), "C");
    assert_eq!(response.attempts(), 3);
    assert_eq!(response.endpoint(), &endpoint(&c));
}

#[tokio::test]
async fn test_all_failing_exhausts_budget() {
    let a = backend("A", 503, 1).await;
    let b = backend("B", 503, 1).await;
    let c = backend("C", 503, 1).await;

    let discovery = InMemoryDiscovery::new();
    discovery.set_endpoints("api", vec![endpoint(&a), endpoint(&b), endpoint(&c)]);
    let client = client(&discovery, no_backoff());

    let err = client.get("api", "/").send().await.unwrap_err();

    match &err {
        HttpClientError::RetryBudgetExhausted { service, attempts, .. } => {
            assert_eq!(service, "api");
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.status_code(), Some(503));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_retried_elsewhere() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = Endpoint::from(listener.local_addr().unwrap());
    drop(listener);
    let alive = backend("alive", 200, 1).await;

    let discovery = InMemoryDiscovery::new();
    discovery.set_endpoints("api", vec![dead.clone(), endpoint(&alive)]);
    let client = client(&discovery, no_backoff());

    let response = client.get("api", "/").send().await.unwrap();

    assert_eq!(response.text().unwrap(), "alive");
    assert_eq!(response.attempts(), 2);
}

#[tokio::test]
async fn test_empty_service_sends_nothing() {
    let discovery = InMemoryDiscovery::new();
    discovery.set_endpoints("hello-node", Vec::new());
    let client = client(&discovery, no_backoff());

    let err = client.get("hello-node", "/").send().await.unwrap_err();

    assert!(matches!(err, HttpClientError::NoHealthyEndpoints { ref service } if service == "hello-node"));
}

#[tokio::test]
async fn test_unknown_service_is_resolution_unavailable() {
    let discovery = InMemoryDiscovery::new();
    let config = ClientConfig::builder()
        .resolve_timeout(Duration::from_millis(50))
        .build();
    let client = client(&discovery, config);

    let err = client.get("nowhere", "/").send().await.unwrap_err();

    assert!(matches!(err, HttpClientError::ResolutionUnavailable { .. }));
    assert_eq!(err.service(), Some("nowhere"));

    // Later requests do not wait again while the source keeps failing
    let started = std::time::Instant::now();
    let err = client.get("nowhere", "/").send().await.unwrap_err();
    assert!(matches!(
        err,
        HttpClientError::ResolutionUnavailable { waited, .. } if waited == Duration::ZERO
    ));
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn test_membership_changes_are_picked_up() {
    let old = backend("old", 200, 1).await;
    let new = backend("new", 200, 1).await;

    let discovery = InMemoryDiscovery::new().with_watch();
    discovery.set_endpoints("api", vec![endpoint(&old)]);
    let client = client(&discovery, no_backoff());

    let first = client.get("api", "/").send().await.unwrap();
    assert_eq!(first.text().unwrap(), "old");

    tokio::time::sleep(Duration::from_millis(20)).await;
    discovery.set_endpoints("api", vec![endpoint(&new)]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = client.get("api", "/").send().await.unwrap();
    assert_eq!(second.text().unwrap(), "new");
}

#[tokio::test]
async fn test_kubernetes_end_to_end() {
    let pod_a = backend("hello from a", 200, 1).await;
    let pod_b = backend("hello from b", 200, 1).await;

    let api = MockServer::start().await;
    let address = |server: &MockServer, pod: &str| {
        serde_json::json!({
            "ip": server.address().ip().to_string(),
            "targetRef": {"kind": "Pod", "name": pod}
        })
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/endpoints/hello-node"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "metadata": {"name": "hello-node", "resourceVersion": "1"},
            "subsets": [
                {"addresses": [address(&pod_a, "hello-node-a")],
                 "ports": [{"name": "http", "port": pod_a.address().port()}]},
                {"addresses": [address(&pod_b, "hello-node-b")],
                 "ports": [{"name": "http", "port": pod_b.address().port()}]}
            ]
        })))
        .mount(&api)
        .await;

    let kubernetes =
        KubernetesDiscovery::new(KubernetesConfig::new(api.uri()).with_port_name("http")).unwrap();
    let client = LoadBalancedClient::new(Arc::new(kubernetes), no_backoff()).unwrap();

    let mut lines = Vec::new();
    for _ in 0..2 {
        let response = client.get("hello-node", "/").send().await.unwrap();
        let pod = response
            .endpoint()
            .metadata(discovery::endpoint::metadata::POD_NAME)
            .unwrap_or_default()
            .to_string();
        lines.push(format!("Response of pod {pod}: {}", response.text().unwrap()));
    }

    assert_eq!(
        lines,
        vec![
            "Response of pod hello-node-a: hello from a",
            "Response of pod hello-node-b: hello from b",
        ]
    );

    let status = client.status("hello-node").unwrap();
    assert_eq!(status.resolver.source, "kubernetes");
    client.shutdown();
}
