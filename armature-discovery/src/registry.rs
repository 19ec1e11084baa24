//! Resolver registry.
//!
//! Maps logical service names to their resolvers, creating at most one
//! resolver per name on first use, and keeps the balancer cursors that must
//! outlive individual requests.

use crate::balancer::BalancerCursor;
use crate::endpoint::EndpointSet;
use crate::error::{DiscoveryError, Result};
use crate::resolver::{Resolver, ResolverConfig, ResolverStatus};
use crate::source::DiscoverySource;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a caller waits for the first snapshot of a new service.
    pub resolve_timeout: Duration,
    /// Stop resolvers that were not used for this long.
    pub idle_timeout: Option<Duration>,
    /// Configuration of each resolver.
    pub resolver: ResolverConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            idle_timeout: None,
            resolver: ResolverConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the first-resolution wait budget
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Evict resolvers idle for longer than `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the resolver configuration
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }
}

/// One registered service: its resolver and per-strategy cursors.
#[derive(Debug)]
pub struct RegistryEntry {
    resolver: Resolver,
    cursors: DashMap<String, Arc<BalancerCursor>>,
    last_access: AtomicU64,
}

impl RegistryEntry {
    /// The service's resolver.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Cursor shared by every request using `strategy` for this service.
    pub fn cursor(&self, strategy: &str) -> Arc<BalancerCursor> {
        if let Some(cursor) = self.cursors.get(strategy) {
            return cursor.clone();
        }
        self.cursors
            .entry(strategy.to_string())
            .or_insert_with(|| Arc::new(BalancerCursor::new()))
            .clone()
    }
}

/// Registry of per-service resolvers sharing one discovery source.
pub struct ResolverRegistry {
    source: Arc<dyn DiscoverySource>,
    config: RegistryConfig,
    entries: DashMap<String, Arc<RegistryEntry>>,
    generations: Arc<AtomicU64>,
    epoch: Instant,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweeper_started: AtomicBool,
    shut_down: AtomicBool,
}

impl ResolverRegistry {
    /// Create a registry. Resolvers are started lazily, on first use.
    pub fn new(source: Arc<dyn DiscoverySource>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            source,
            config,
            entries: DashMap::new(),
            generations: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
            sweeper: Mutex::new(None),
            sweeper_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Name of the discovery source.
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Entry for `service`, starting its resolver if this is the first use.
    pub fn entry(self: &Arc<Self>, service: &str) -> Result<Arc<RegistryEntry>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DiscoveryError::Shutdown(service.to_string()));
        }

        let entry = match self.entries.get(service) {
            Some(entry) => entry.clone(),
            None => {
                self.ensure_sweeper();
                self.entries
                    .entry(service.to_string())
                    .or_insert_with(|| {
                        debug!(service = %service, source = %self.source.name(), "Creating resolver");
                        Arc::new(RegistryEntry {
                            resolver: Resolver::spawn_with_generations(
                                service,
                                self.source.clone(),
                                self.config.resolver.clone(),
                                self.generations.clone(),
                            ),
                            cursors: DashMap::new(),
                            last_access: AtomicU64::new(0),
                        })
                    })
                    .clone()
            }
        };

        entry.last_access.store(self.now_millis(), Ordering::Release);
        Ok(entry)
    }

    /// Current endpoint set of `service`.
    ///
    /// Never blocks once a snapshot exists. On first use, waits up to the
    /// configured resolve timeout for the first resolution.
    pub async fn get(self: &Arc<Self>, service: &str) -> Result<Arc<EndpointSet>> {
        let entry = self.entry(service)?;
        entry
            .resolver()
            .wait_ready(self.config.resolve_timeout)
            .await
    }

    /// Cursor for `service` under `strategy`.
    pub fn cursor(self: &Arc<Self>, service: &str, strategy: &str) -> Result<Arc<BalancerCursor>> {
        Ok(self.entry(service)?.cursor(strategy))
    }

    /// Force an immediate refresh of `service`.
    pub async fn refresh(self: &Arc<Self>, service: &str) -> Result<Arc<EndpointSet>> {
        self.entry(service)?.resolver().refresh().await
    }

    /// Whether a resolver exists for `service`.
    pub fn contains(&self, service: &str) -> bool {
        self.entries.contains_key(service)
    }

    /// Names of the services being resolved.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of live resolvers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no resolver exists.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Status of one service.
    pub fn status(&self, service: &str) -> Option<ResolverStatus> {
        self.entries.get(service).map(|e| e.resolver().status())
    }

    /// Status of every service, sorted by name.
    pub fn statuses(&self) -> Vec<ResolverStatus> {
        let mut statuses: Vec<ResolverStatus> =
            self.entries.iter().map(|e| e.resolver().status()).collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Stop and remove resolvers idle for longer than the idle timeout.
    /// Returns the number of evicted resolvers.
    pub fn evict_idle(&self) -> usize {
        let Some(idle) = self.config.idle_timeout else {
            return 0;
        };
        let now = self.now_millis();
        let idle_ms = idle.as_millis() as u64;

        let before = self.entries.len();
        self.entries.retain(|service, entry| {
            let last = entry.last_access.load(Ordering::Acquire);
            let keep = now.saturating_sub(last) < idle_ms;
            if !keep {
                info!(service = %service, idle = ?idle, "Evicting idle resolver");
                entry.resolver().shutdown();
            }
            keep
        });
        before.saturating_sub(self.entries.len())
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let Some(idle) = self.config.idle_timeout else {
            return;
        };
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let period = (idle / 2).max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.evict_idle();
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop every resolver. Further lookups fail with `Shutdown`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(resolvers = self.entries.len(), "Shutting down resolver registry");

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        for entry in self.entries.iter() {
            entry.resolver().shutdown();
        }
        self.entries.clear();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for ResolverRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("source", &self.source.name())
            .field("services", &self.services())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::memory::InMemoryDiscovery;

    fn registry(discovery: &InMemoryDiscovery, config: RegistryConfig) -> Arc<ResolverRegistry> {
        ResolverRegistry::new(Arc::new(discovery.clone()), config)
    }

    #[tokio::test]
    async fn test_one_resolver_per_name() {
        let discovery = InMemoryDiscovery::new();
        discovery.set_endpoints("api", vec![Endpoint::new("10.0.0.1", 80)]);
        let registry = registry(&discovery, RegistryConfig::default());

        let a = registry.entry("api").unwrap();
        let b = registry.entry("api").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_is_shared() {
        let discovery = InMemoryDiscovery::new();
        let registry = registry(&discovery, RegistryConfig::default());

        let a = registry.cursor("api", "round_robin").unwrap();
        let b = registry.cursor("api", "round_robin").unwrap();
        let c = registry.cursor("api", "random").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_statuses() {
        let discovery = InMemoryDiscovery::new();
        discovery.set_endpoints("b", vec![Endpoint::new("10.0.0.2", 80)]);
        discovery.set_endpoints("a", vec![Endpoint::new("10.0.0.1", 80)]);
        let registry = registry(&discovery, RegistryConfig::default());

        registry.get("b").await.unwrap();
        registry.get("a").await.unwrap();

        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].service, "a");
        assert_eq!(statuses[1].endpoints.len(), 1);
        assert!(registry.status("c").is_none());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let discovery = InMemoryDiscovery::new();
        discovery.set_endpoints("api", vec![Endpoint::new("10.0.0.1", 80)]);
        let registry = registry(
            &discovery,
            RegistryConfig::default().with_idle_timeout(Duration::from_millis(30)),
        );

        registry.get("api").await.unwrap();
        assert!(registry.contains("api"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!registry.contains("api"));
    }

    #[tokio::test]
    async fn test_generation_survives_eviction() {
        let discovery = InMemoryDiscovery::new();
        discovery.set_endpoints("api", vec![Endpoint::new("10.0.0.1", 80)]);
        let registry = registry(
            &discovery,
            RegistryConfig::default().with_idle_timeout(Duration::from_secs(3600)),
        );

        let first = registry.get("api").await.unwrap();
        registry.entries.clear();
        let second = registry.get("api").await.unwrap();

        assert!(second.generation() > first.generation());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_lookups() {
        let discovery = InMemoryDiscovery::new();
        discovery.set_endpoints("api", vec![Endpoint::new("10.0.0.1", 80)]);
        let registry = registry(&discovery, RegistryConfig::default());

        registry.get("api").await.unwrap();
        registry.shutdown();

        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("api").await,
            Err(DiscoveryError::Shutdown(_))
        ));
    }
}
