//! Calls every pod of the `hello-node` service in turn.
//!
//! Inside a cluster the endpoints come from the Kubernetes API. Elsewhere,
//! list them in `HELLO_NODE_ENDPOINTS` (comma separated `host:port`).
//!
//! ```bash
//! RUST_LOG=armature_discovery=debug cargo run -p armature-lb-client --example hello_node
//! ```

use armature_lb_client::discovery::endpoint::metadata;
use armature_lb_client::discovery::{
    DiscoverySource, Endpoint, InMemoryDiscovery, KubernetesDiscovery,
};
use armature_lb_client::{ClientConfig, LoadBalancedClient};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "hello-node";

fn static_endpoints() -> Result<InMemoryDiscovery, Box<dyn std::error::Error>> {
    let list = std::env::var("HELLO_NODE_ENDPOINTS")
        .unwrap_or_else(|_| "127.0.0.1:8081,127.0.0.1:8082".to_string());

    let discovery = InMemoryDiscovery::new();
    let mut endpoints = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, port) = entry
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{entry}'"))?;
        endpoints.push(Endpoint::new(host, port.parse()?));
    }
    discovery.set_endpoints(SERVICE, endpoints);
    Ok(discovery)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let source: Arc<dyn DiscoverySource> = match KubernetesDiscovery::in_cluster() {
        Ok(kubernetes) => Arc::new(kubernetes),
        Err(_) => Arc::new(static_endpoints()?),
    };

    let config = ClientConfig::from_env()?;
    let client = LoadBalancedClient::new(source, config)?;

    for _ in 0..6 {
        match client.get(SERVICE, "/").send().await {
            Ok(response) => {
                let endpoint = response.endpoint();
                let pod = endpoint
                    .metadata(metadata::POD_NAME)
                    .map(str::to_string)
                    .unwrap_or_else(|| endpoint.authority());
                println!("Response of pod {pod}: {}", response.text()?);
            }
            Err(e) => println!("Request to {SERVICE} failed: {e}"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    if let Some(status) = client.status(SERVICE) {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }

    client.shutdown();
    Ok(())
}
