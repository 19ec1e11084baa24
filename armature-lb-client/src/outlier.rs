//! Outlier detection.
//!
//! Endpoints that fail repeatedly are ejected from selection for a period
//! that grows with every ejection. Recording an outcome only touches atomics
//! and a short-lived lock, so it never blocks the response path.

use armature_discovery::{Endpoint, EndpointSet};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Selection state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Endpoint takes traffic.
    Healthy,
    /// Endpoint is skipped until the instant passes.
    Ejected {
        /// End of the ejection.
        until: Instant,
    },
}

/// Outlier detection configuration.
#[derive(Debug, Clone)]
pub struct OutlierConfig {
    /// Consecutive failures that eject an endpoint.
    pub consecutive_failures: u32,
    /// Length of the first ejection.
    pub base_ejection: Duration,
    /// Upper bound of an ejection.
    pub max_ejection: Duration,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            base_ejection: Duration::from_secs(10),
            max_ejection: Duration::from_secs(300),
        }
    }
}

impl OutlierConfig {
    /// Create a new outlier config.
    pub fn new(consecutive_failures: u32, base_ejection: Duration) -> Self {
        Self {
            consecutive_failures,
            base_ejection,
            ..Default::default()
        }
    }

    /// Set the maximum ejection time.
    pub fn with_max_ejection(mut self, max: Duration) -> Self {
        self.max_ejection = max;
        self
    }

    /// Ejection time for the `n`th consecutive ejection (1-based).
    pub fn ejection_for(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_ejection.saturating_mul(factor).min(self.max_ejection)
    }
}

#[derive(Debug, Default)]
struct EndpointHealth {
    failures: AtomicU32,
    ejections: AtomicU32,
    ejected_until: RwLock<Option<Instant>>,
}

type HealthKey = (String, String);

fn key(service: &str, endpoint: &Endpoint) -> HealthKey {
    (service.to_string(), endpoint.authority())
}

/// Tracks endpoint failures per service and ejects outliers.
#[derive(Debug)]
pub struct OutlierDetector {
    config: OutlierConfig,
    endpoints: DashMap<HealthKey, EndpointHealth>,
    generations: DashMap<String, u64>,
}

impl OutlierDetector {
    /// Create a new detector.
    pub fn new(config: OutlierConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    /// Detector configuration.
    pub fn config(&self) -> &OutlierConfig {
        &self.config
    }

    /// Current state of an endpoint of `service`.
    pub fn state(&self, service: &str, endpoint: &Endpoint) -> EndpointState {
        let Some(health) = self.endpoints.get(&key(service, endpoint)) else {
            return EndpointState::Healthy;
        };
        match *health.ejected_until.read() {
            Some(until) if until > Instant::now() => EndpointState::Ejected { until },
            _ => EndpointState::Healthy,
        }
    }

    /// Whether an endpoint of `service` is currently ejected.
    pub fn is_ejected(&self, service: &str, endpoint: &Endpoint) -> bool {
        matches!(self.state(service, endpoint), EndpointState::Ejected { .. })
    }

    /// Record a successful request.
    pub fn record_success(&self, service: &str, endpoint: &Endpoint) {
        let Some(health) = self.endpoints.get(&key(service, endpoint)) else {
            return;
        };
        health.failures.store(0, Ordering::SeqCst);

        let mut ejected_until = health.ejected_until.write();
        if ejected_until.is_some_and(|until| until <= Instant::now()) {
            info!(service = %service, endpoint = %endpoint, "Endpoint recovered");
            *ejected_until = None;
            health.ejections.store(0, Ordering::SeqCst);
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self, service: &str, endpoint: &Endpoint) {
        let health = self.endpoints.entry(key(service, endpoint)).or_default();

        let failures = health.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.config.consecutive_failures {
            debug!(service = %service, endpoint = %endpoint, failures, "Endpoint failure recorded");
            return;
        }

        let now = Instant::now();
        let mut ejected_until = health.ejected_until.write();
        if ejected_until.is_some_and(|until| until > now) {
            // Already ejected, nothing to do
            return;
        }

        let ejections = health.ejections.fetch_add(1, Ordering::SeqCst) + 1;
        let duration = self.config.ejection_for(ejections);
        warn!(
            service = %service,
            endpoint = %endpoint,
            failures,
            ejection = ?duration,
            "Ejecting endpoint"
        );
        *ejected_until = Some(now + duration);
        health.failures.store(0, Ordering::SeqCst);
    }

    /// Authorities of the endpoints of `set` that are ejected right now.
    ///
    /// The first call for a new generation forgets endpoints of the service
    /// that are no longer part of it.
    pub fn ejected(&self, set: &EndpointSet) -> HashSet<String> {
        self.observe(set);
        set.iter()
            .filter(|e| self.is_ejected(set.service(), e))
            .map(Endpoint::authority)
            .collect()
    }

    fn observe(&self, set: &EndpointSet) {
        let previous = self
            .generations
            .insert(set.service().to_string(), set.generation());
        if previous == Some(set.generation()) {
            return;
        }

        let members: HashSet<String> = set.iter().map(Endpoint::authority).collect();
        let before = self.endpoints.len();
        self.endpoints
            .retain(|(service, authority), _| service != set.service() || members.contains(authority));
        let pruned = before.saturating_sub(self.endpoints.len());
        if pruned > 0 {
            debug!(
                service = %set.service(),
                generation = set.generation(),
                pruned,
                "Forgot health of departed endpoints"
            );
        }
    }

    /// Reset an endpoint to healthy.
    pub fn reset(&self, service: &str, endpoint: &Endpoint) {
        self.endpoints.remove(&key(service, endpoint));
    }

    /// Number of consecutive failures recorded for an endpoint.
    pub fn failure_count(&self, service: &str, endpoint: &Endpoint) -> u32 {
        self.endpoints
            .get(&key(service, endpoint))
            .map(|h| h.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of endpoints with recorded health.
    pub fn tracked(&self) -> usize {
        self.endpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.0.1", 8080)
    }

    #[test]
    fn test_ejects_after_consecutive_failures() {
        let detector = OutlierDetector::new(OutlierConfig::new(3, Duration::from_secs(10)));
        let endpoint = endpoint();

        detector.record_failure("api", &endpoint);
        detector.record_failure("api", &endpoint);
        assert_eq!(detector.state("api", &endpoint), EndpointState::Healthy);

        detector.record_failure("api", &endpoint);
        assert!(detector.is_ejected("api", &endpoint));
    }

    #[test]
    fn test_success_resets_failures() {
        let detector = OutlierDetector::new(OutlierConfig::new(3, Duration::from_secs(10)));
        let endpoint = endpoint();

        detector.record_failure("api", &endpoint);
        detector.record_failure("api", &endpoint);
        detector.record_success("api", &endpoint);

        assert_eq!(detector.failure_count("api", &endpoint), 0);
        assert!(!detector.is_ejected("api", &endpoint));
    }

    #[test]
    fn test_ejection_expires() {
        let detector = OutlierDetector::new(OutlierConfig::new(1, Duration::from_millis(20)));
        let endpoint = endpoint();

        detector.record_failure("api", &endpoint);
        assert!(detector.is_ejected("api", &endpoint));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!detector.is_ejected("api", &endpoint));
    }

    #[test]
    fn test_ejection_grows() {
        let config = OutlierConfig::new(5, Duration::from_secs(10))
            .with_max_ejection(Duration::from_secs(60));

        assert_eq!(config.ejection_for(1), Duration::from_secs(10));
        assert_eq!(config.ejection_for(2), Duration::from_secs(20));
        assert_eq!(config.ejection_for(3), Duration::from_secs(40));
        assert_eq!(config.ejection_for(4), Duration::from_secs(60));
        assert_eq!(config.ejection_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_ejected_authorities() {
        let detector = OutlierDetector::new(OutlierConfig::new(1, Duration::from_secs(10)));
        let set = EndpointSet::new(
            "api",
            1,
            vec![Endpoint::new("10.0.0.1", 80), Endpoint::new("10.0.0.2", 80)],
        );

        detector.record_failure("api", &set.endpoints()[1]);
        let ejected = detector.ejected(&set);

        assert_eq!(ejected.len(), 1);
        assert!(ejected.contains("10.0.0.2:80"));
    }

    #[test]
    fn test_departed_endpoints_are_forgotten() {
        let detector = OutlierDetector::new(OutlierConfig::new(1, Duration::from_secs(10)));
        let old = EndpointSet::new(
            "api",
            1,
            vec![Endpoint::new("10.0.0.1", 80), Endpoint::new("10.0.0.2", 80)],
        );
        detector.record_failure("api", &old.endpoints()[0]);
        detector.record_failure("api", &old.endpoints()[1]);
        detector.record_failure("other", &Endpoint::new("10.0.0.1", 80));
        assert_eq!(detector.ejected(&old).len(), 2);
        assert_eq!(detector.tracked(), 3);

        // Pods rotated: only 10.0.0.2 survives the new generation
        let new = EndpointSet::new(
            "api",
            2,
            vec![Endpoint::new("10.0.0.2", 80), Endpoint::new("10.0.0.3", 80)],
        );
        let ejected = detector.ejected(&new);

        assert_eq!(ejected.len(), 1);
        assert!(ejected.contains("10.0.0.2:80"));
        assert_eq!(detector.tracked(), 2);
        // Other services keep their state
        assert!(detector.is_ejected("other", &Endpoint::new("10.0.0.1", 80)));
    }
}
