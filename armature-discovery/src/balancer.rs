//! Load balancing strategies.
//!
//! A strategy is stateless; the per-service, per-strategy state lives in a
//! [`BalancerCursor`] owned by the registry entry. Selection only touches
//! atomics, so concurrent requests to the same service never queue behind a
//! lock.

use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{DiscoveryError, Result};
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Result of one attempt against a selected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The endpoint answered.
    Success,
    /// Connection or protocol failure.
    Failure,
    /// The attempt timed out.
    Timeout,
}

/// Ephemeral record of an attempt, reported back to the strategy.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    /// Endpoint that was tried.
    pub endpoint: Endpoint,
    /// How the attempt ended.
    pub kind: OutcomeKind,
    /// Time spent on the attempt.
    pub latency: Duration,
}

impl SelectionOutcome {
    /// Create a new outcome.
    pub fn new(endpoint: Endpoint, kind: OutcomeKind, latency: Duration) -> Self {
        Self {
            endpoint,
            kind,
            latency,
        }
    }

    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

/// Selection state for one service and one strategy.
#[derive(Debug, Default)]
pub struct BalancerCursor {
    next: AtomicUsize,
    generation: AtomicU64,
    size: AtomicUsize,
    pending: DashMap<String, AtomicUsize>,
}

impl BalancerCursor {
    /// Create a fresh cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current index and advance it.
    pub fn advance(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Current index without advancing.
    pub fn position(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Track the generation of the set being selected from. When the set of
    /// a new generation is smaller than the previous one the index restarts at 0.
    pub fn observe(&self, set: &EndpointSet) {
        let generation = set.generation();
        if self.generation.load(Ordering::Acquire) == generation {
            return;
        }
        if self.generation.swap(generation, Ordering::AcqRel) == generation {
            return;
        }

        let previous_size = self.size.swap(set.len(), Ordering::AcqRel);
        if set.len() < previous_size {
            debug!(
                service = %set.service(),
                generation,
                previous_size,
                size = set.len(),
                "Endpoint set shrank, resetting cursor"
            );
            self.next.store(0, Ordering::Release);
        }

        self.pending.retain(|authority, count| {
            count.load(Ordering::Relaxed) > 0 || set.iter().any(|e| &e.authority() == authority)
        });
    }

    /// Number of in-flight requests against an endpoint.
    pub fn pending(&self, authority: &str) -> usize {
        self.pending
            .get(authority)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a request starting against an endpoint.
    pub fn begin(&self, authority: &str) {
        if let Some(count) = self.pending.get(authority) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.pending
            .entry(authority.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request against an endpoint finishing.
    pub fn finish(&self, authority: &str) {
        if let Some(count) = self.pending.get(authority) {
            let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// Reset the index.
    pub fn reset(&self) {
        self.next.store(0, Ordering::Release);
    }
}

/// A pluggable endpoint selection strategy.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Strategy name; cursors are keyed by it.
    fn name(&self) -> &str;

    /// Select one endpoint. An empty set yields
    /// [`DiscoveryError::NoHealthyEndpoints`].
    fn select<'a>(&self, set: &'a EndpointSet, cursor: &BalancerCursor) -> Result<&'a Endpoint>;

    /// Called when a request is sent to `endpoint`.
    fn on_dispatch(&self, endpoint: &Endpoint, cursor: &BalancerCursor) {
        let _ = (endpoint, cursor);
    }

    /// Called with the outcome of every attempt.
    fn report(&self, outcome: &SelectionOutcome, cursor: &BalancerCursor) {
        let _ = (outcome, cursor);
    }
}

fn non_empty(set: &EndpointSet) -> Result<usize> {
    match set.len() {
        0 => Err(DiscoveryError::no_healthy_endpoints(set.service())),
        n => Ok(n),
    }
}

/// Cycles through the endpoints in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin;

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select<'a>(&self, set: &'a EndpointSet, cursor: &BalancerCursor) -> Result<&'a Endpoint> {
        let len = non_empty(set)?;
        cursor.observe(set);
        let index = cursor.advance() % len;
        Ok(&set.endpoints()[index])
    }
}

/// Uniformly random selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl LoadBalancer for Random {
    fn name(&self) -> &str {
        "random"
    }

    fn select<'a>(&self, set: &'a EndpointSet, _cursor: &BalancerCursor) -> Result<&'a Endpoint> {
        let len = non_empty(set)?;
        let index = rand::rng().random_range(0..len);
        Ok(&set.endpoints()[index])
    }
}

/// Power-of-two-choices over in-flight request counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastPending;

impl LoadBalancer for LeastPending {
    fn name(&self) -> &str {
        "least_pending"
    }

    fn select<'a>(&self, set: &'a EndpointSet, cursor: &BalancerCursor) -> Result<&'a Endpoint> {
        let len = non_empty(set)?;
        cursor.observe(set);
        if len == 1 {
            return Ok(&set.endpoints()[0]);
        }

        let mut rng = rand::rng();
        let a = rng.random_range(0..len);
        let mut b = rng.random_range(0..len - 1);
        if b >= a {
            b += 1;
        }

        let (first, second) = (&set.endpoints()[a], &set.endpoints()[b]);
        if cursor.pending(&second.authority()) < cursor.pending(&first.authority()) {
            Ok(second)
        } else {
            Ok(first)
        }
    }

    fn on_dispatch(&self, endpoint: &Endpoint, cursor: &BalancerCursor) {
        cursor.begin(&endpoint.authority());
    }

    fn report(&self, outcome: &SelectionOutcome, cursor: &BalancerCursor) {
        cursor.finish(&outcome.endpoint.authority());
    }
}

/// Always picks the first endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct First;

impl LoadBalancer for First {
    fn name(&self) -> &str {
        "first"
    }

    fn select<'a>(&self, set: &'a EndpointSet, _cursor: &BalancerCursor) -> Result<&'a Endpoint> {
        non_empty(set)?;
        Ok(&set.endpoints()[0])
    }
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    /// Round-robin selection
    #[default]
    RoundRobin,

    /// Random selection
    Random,

    /// Fewest in-flight requests (power of two choices)
    LeastPending,

    /// Always pick first available
    First,
}

impl LoadBalancingStrategy {
    /// Build the strategy implementation.
    pub fn build(self) -> Arc<dyn LoadBalancer> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobin),
            Self::Random => Arc::new(Random),
            Self::LeastPending => Arc::new(LeastPending),
            Self::First => Arc::new(First),
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_pending" | "leastpending" | "p2c" => Ok(Self::LeastPending),
            "first" => Ok(Self::First),
            _ => Err(DiscoveryError::UnknownStrategy(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn set(generation: u64, hosts: &[&str]) -> EndpointSet {
        EndpointSet::new(
            "hello-node",
            generation,
            hosts.iter().map(|h| Endpoint::new(*h, 80)).collect(),
        )
    }

    #[test]
    fn test_round_robin_visits_each_endpoint_once() {
        let set = set(1, &["a", "b", "c", "d", "e"]);
        let cursor = BalancerCursor::new();

        let picked: Vec<String> = (0..set.len())
            .map(|_| RoundRobin.select(&set, &cursor).unwrap().host.clone())
            .collect();
        let unique: HashSet<&String> = picked.iter().collect();

        assert_eq!(unique.len(), set.len());
        assert_eq!(picked, vec!["a", "b", "c", "d", "e"]);

        // Same cyclic order on the next lap
        let lap: Vec<String> = (0..set.len())
            .map(|_| RoundRobin.select(&set, &cursor).unwrap().host.clone())
            .collect();
        assert_eq!(lap, picked);
    }

    #[test]
    fn test_round_robin_hello_node() {
        let set = set(1, &["A", "B", "C"]);
        let cursor = BalancerCursor::new();

        let picks: Vec<String> = (0..4)
            .map(|_| RoundRobin.select(&set, &cursor).unwrap().authority())
            .collect();
        assert_eq!(picks, vec!["A:80", "B:80", "C:80", "A:80"]);
    }

    #[test]
    fn test_round_robin_survives_shrinking_set() {
        let cursor = BalancerCursor::new();
        let large = set(1, &["a", "b", "c", "d", "e"]);
        for _ in 0..4 {
            RoundRobin.select(&large, &cursor).unwrap();
        }

        let small = set(2, &["a", "b"]);
        for _ in 0..10 {
            let picked = RoundRobin.select(&small, &cursor).unwrap();
            assert!(picked.host == "a" || picked.host == "b");
        }
    }

    #[test]
    fn test_round_robin_wraps_without_observing_generation() {
        // Same generation but a filtered view: modulo keeps the index valid
        let cursor = BalancerCursor::new();
        let full = set(3, &["a", "b", "c", "d"]);
        for _ in 0..3 {
            RoundRobin.select(&full, &cursor).unwrap();
        }
        let view = full.excluding(&["d:80".to_string()].into_iter().collect());
        assert_eq!(RoundRobin.select(&view, &cursor).unwrap().host, "a");
    }

    #[test]
    fn test_empty_set_yields_no_healthy_endpoints() {
        let empty = set(1, &[]);
        let cursor = BalancerCursor::new();

        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::Random,
            LoadBalancingStrategy::LeastPending,
            LoadBalancingStrategy::First,
        ] {
            let err = strategy.build().select(&empty, &cursor).unwrap_err();
            assert!(matches!(err, DiscoveryError::NoHealthyEndpoints { ref service } if service == "hello-node"));
        }
    }

    #[test]
    fn test_random_stays_in_range() {
        let set = set(1, &["a", "b", "c"]);
        let cursor = BalancerCursor::new();
        for _ in 0..100 {
            let picked = Random.select(&set, &cursor).unwrap();
            assert!(["a", "b", "c"].contains(&picked.host.as_str()));
        }
    }

    #[test]
    fn test_random_is_roughly_uniform() {
        let set = set(1, &["a", "b", "c"]);
        let cursor = BalancerCursor::new();
        let mut counts = std::collections::HashMap::new();

        for _ in 0..3000 {
            let picked = Random.select(&set, &cursor).unwrap();
            *counts.entry(picked.host.clone()).or_insert(0usize) += 1;
        }

        assert_eq!(counts.len(), 3);
        for (host, count) in counts {
            assert!((600..=1400).contains(&count), "{host} picked {count} times");
        }
    }

    #[test]
    fn test_least_pending_prefers_idle_endpoint() {
        let set = set(1, &["busy", "idle"]);
        let cursor = BalancerCursor::new();
        for _ in 0..5 {
            cursor.begin("busy:80");
        }

        for _ in 0..20 {
            assert_eq!(LeastPending.select(&set, &cursor).unwrap().host, "idle");
        }
    }

    #[test]
    fn test_least_pending_tracks_outcomes() {
        let cursor = BalancerCursor::new();
        let endpoint = Endpoint::new("a", 80);

        LeastPending.on_dispatch(&endpoint, &cursor);
        LeastPending.on_dispatch(&endpoint, &cursor);
        assert_eq!(cursor.pending("a:80"), 2);

        let outcome = SelectionOutcome::new(endpoint, OutcomeKind::Success, Duration::from_millis(3));
        LeastPending.report(&outcome, &cursor);
        assert_eq!(cursor.pending("a:80"), 1);
    }

    #[test]
    fn test_finish_never_underflows() {
        let cursor = BalancerCursor::new();
        cursor.begin("a:80");
        cursor.finish("a:80");
        cursor.finish("a:80");
        assert_eq!(cursor.pending("a:80"), 0);
    }

    #[test]
    fn test_first_strategy() {
        let set = set(1, &["a", "b"]);
        let cursor = BalancerCursor::new();
        assert_eq!(First.select(&set, &cursor).unwrap().host, "a");
        assert_eq!(First.select(&set, &cursor).unwrap().host, "a");
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "round-robin".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::RoundRobin
        );
        assert_eq!(
            "LEAST_PENDING".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::LeastPending
        );
        assert!("weighted".parse::<LoadBalancingStrategy>().is_err());
        assert_eq!(LoadBalancingStrategy::Random.build().name(), "random");
    }
}
