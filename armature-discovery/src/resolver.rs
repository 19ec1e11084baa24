//! Per-service resolver.
//!
//! A [`Resolver`] owns one background task that keeps the endpoint set of a
//! single logical service up to date, either by polling the discovery source
//! or by consuming its watch stream. Readers load the latest snapshot through
//! an atomic pointer; only refreshes take the per-service lock.

use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{DiscoveryError, Result};
use crate::source::DiscoverySource;
use arc_swap::ArcSwapOption;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Interval between two polls of the discovery source.
    pub refresh_interval: Duration,
    /// Delay before retrying after a failed refresh or a closed watch.
    pub error_backoff: Duration,
    /// Use the source's watch stream when it offers one.
    pub use_watch: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            use_watch: true,
        }
    }
}

impl ResolverConfig {
    /// Set the polling interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the retry delay after failures.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Always poll, even when the source can watch.
    pub fn polling_only(mut self) -> Self {
        self.use_watch = false;
        self
    }
}

/// Point-in-time view of a resolver, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverStatus {
    /// Logical service name
    pub service: String,
    /// Discovery source name
    pub source: String,
    /// Generation of the current snapshot, if any
    pub generation: Option<u64>,
    /// Endpoints of the current snapshot
    pub endpoints: Vec<Endpoint>,
    /// Time since the last successful refresh
    pub staleness: Option<Duration>,
    /// Last discovery error, cleared by the next successful refresh
    pub last_error: Option<String>,
    /// Completed refresh attempts
    pub refreshes: u64,
}

struct ResolverState {
    service: String,
    source: Arc<dyn DiscoverySource>,
    generations: Arc<AtomicU64>,
    snapshot: ArcSwapOption<EndpointSet>,
    published: watch::Sender<Option<Arc<EndpointSet>>>,
    inflight: tokio::sync::Mutex<()>,
    refreshes: AtomicU64,
    last_refresh: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    watching: AtomicBool,
    timed_out: AtomicBool,
}

impl ResolverState {
    async fn refresh(&self) -> Result<Arc<EndpointSet>> {
        let seen = self.refreshes.load(Ordering::Acquire);
        let _guard = self.inflight.lock().await;

        if self.refreshes.load(Ordering::Acquire) != seen {
            // Another caller refreshed while this one waited for the lock
            return self.settled();
        }

        let result = match self.source.list(&self.service).await {
            Ok(endpoints) => Ok(self.apply(endpoints)),
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        };
        self.refreshes.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn apply_update(&self, update: Result<Vec<Endpoint>>) {
        let _guard = self.inflight.lock().await;
        match update {
            Ok(endpoints) => {
                self.apply(endpoints);
            }
            Err(e) => self.record_error(&e),
        }
        self.refreshes.fetch_add(1, Ordering::AcqRel);
    }

    /// Publish `endpoints`. Must be called with `inflight` held.
    fn apply(&self, endpoints: Vec<Endpoint>) -> Arc<EndpointSet> {
        *self.last_refresh.write() = Some(Instant::now());
        *self.last_error.write() = None;

        let current = self.snapshot.load_full();
        if let Some(current) = current.as_ref()
            && current.same_endpoints(&endpoints)
        {
            debug!(
                service = %self.service,
                generation = current.generation(),
                "Endpoints unchanged"
            );
            return current.clone();
        }

        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let set = Arc::new(EndpointSet::new(self.service.clone(), generation, endpoints));

        if set.is_empty() {
            warn!(
                service = %self.service,
                generation,
                "Discovery reports no healthy endpoints"
            );
        } else {
            info!(
                service = %self.service,
                generation,
                endpoints = set.len(),
                "Published new endpoint set"
            );
        }

        self.snapshot.store(Some(set.clone()));
        self.published.send_replace(Some(set.clone()));
        set
    }

    fn record_error(&self, error: &DiscoveryError) {
        if self.watching.load(Ordering::Acquire) && self.last_error.read().is_none() {
            // The snapshot was current up to the moment the watch failed
            *self.last_refresh.write() = Some(Instant::now());
        }
        let staleness = self.staleness();
        warn!(
            service = %self.service,
            source = %self.source.name(),
            error = %error,
            stale_for = ?staleness,
            has_snapshot = self.snapshot.load().is_some(),
            "Discovery refresh failed, keeping last known endpoints"
        );
        *self.last_error.write() = Some(error.to_string());
    }

    /// Age of the snapshot. A connected watch without errors is current.
    fn staleness(&self) -> Option<Duration> {
        let last = (*self.last_refresh.read())?;
        if self.watching.load(Ordering::Acquire) && self.last_error.read().is_none() {
            return Some(Duration::ZERO);
        }
        Some(last.elapsed())
    }

    fn start_watch(&self) {
        self.watching.store(true, Ordering::Release);
    }

    fn end_watch(&self) {
        if self.watching.swap(false, Ordering::AcqRel) && self.last_error.read().is_none() {
            *self.last_refresh.write() = Some(Instant::now());
        }
    }

    fn settled(&self) -> Result<Arc<EndpointSet>> {
        if let Some(message) = self.last_error.read().clone() {
            return Err(DiscoveryError::unavailable(
                self.source.name(),
                &self.service,
                message,
            ));
        }
        self.snapshot.load_full().ok_or_else(|| {
            DiscoveryError::unavailable(self.source.name(), &self.service, "no snapshot yet")
        })
    }
}

async fn run(state: Arc<ResolverState>, config: ResolverConfig) {
    info!(
        service = %state.service,
        source = %state.source.name(),
        "Starting resolver"
    );
    let mut watch_enabled = config.use_watch;

    loop {
        let listed = state.refresh().await.is_ok();

        if watch_enabled && listed {
            match state.source.watch(&state.service).await {
                Ok(Some(mut updates)) => {
                    debug!(service = %state.service, "Watching for endpoint changes");
                    state.start_watch();
                    while let Some(update) = updates.recv().await {
                        state.apply_update(update).await;
                    }
                    state.end_watch();
                    debug!(service = %state.service, "Watch closed, listing again");
                    tokio::time::sleep(config.error_backoff).await;
                    continue;
                }
                Ok(None) => watch_enabled = false,
                Err(e) => state.record_error(&e),
            }
        }

        let delay = if listed {
            config.refresh_interval
        } else {
            config.error_backoff
        };
        tokio::time::sleep(delay).await;
    }
}

/// Keeps the endpoint set of one logical service up to date.
///
/// Dropping the resolver stops its background task.
pub struct Resolver {
    state: Arc<ResolverState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// Start resolving `service`. Must be called within a Tokio runtime.
    pub fn spawn(
        service: impl Into<String>,
        source: Arc<dyn DiscoverySource>,
        config: ResolverConfig,
    ) -> Self {
        Self::spawn_with_generations(service, source, config, Arc::new(AtomicU64::new(0)))
    }

    /// Start resolving with a shared generation counter, so generations stay
    /// monotonic when a resolver for the same name is recreated.
    pub(crate) fn spawn_with_generations(
        service: impl Into<String>,
        source: Arc<dyn DiscoverySource>,
        config: ResolverConfig,
        generations: Arc<AtomicU64>,
    ) -> Self {
        let (published, _) = watch::channel(None);
        let state = Arc::new(ResolverState {
            service: service.into(),
            source,
            generations,
            snapshot: ArcSwapOption::empty(),
            published,
            inflight: tokio::sync::Mutex::new(()),
            refreshes: AtomicU64::new(0),
            last_refresh: RwLock::new(None),
            last_error: RwLock::new(None),
            watching: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        });

        let task = tokio::spawn(run(state.clone(), config));

        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Logical service name.
    pub fn service(&self) -> &str {
        &self.state.service
    }

    /// Latest snapshot, if one was ever obtained. Never blocks.
    pub fn current(&self) -> Option<Arc<EndpointSet>> {
        self.state.snapshot.load_full()
    }

    /// Latest snapshot, waiting up to `timeout` for the first one.
    ///
    /// Once a wait has timed out, later callers fail immediately for as long
    /// as the source keeps failing and no snapshot exists.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<Arc<EndpointSet>> {
        if let Some(set) = self.current() {
            return Ok(set);
        }
        if self.state.timed_out.load(Ordering::Acquire)
            && let Some(last_error) = self.last_error()
        {
            return Err(DiscoveryError::ResolutionUnavailable {
                service: self.state.service.clone(),
                waited: Duration::ZERO,
                last_error: Some(last_error),
            });
        }

        let mut rx = self.state.published.subscribe();
        let started = Instant::now();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(published)) => published
                .clone()
                .ok_or_else(|| DiscoveryError::Shutdown(self.state.service.clone())),
            Ok(Err(_)) => Err(DiscoveryError::Shutdown(self.state.service.clone())),
            Err(_) => {
                self.state.timed_out.store(true, Ordering::Release);
                Err(DiscoveryError::ResolutionUnavailable {
                    service: self.state.service.clone(),
                    waited: started.elapsed(),
                    last_error: self.last_error(),
                })
            }
        }
    }

    /// Refresh now. Concurrent callers share one in-flight refresh.
    pub async fn refresh(&self) -> Result<Arc<EndpointSet>> {
        self.state.refresh().await
    }

    /// Stream of snapshots, starting with the current one if any.
    pub fn subscribe(&self) -> impl Stream<Item = Arc<EndpointSet>> + Send + 'static {
        WatchStream::new(self.state.published.subscribe()).filter_map(|set| set)
    }

    /// Age of the current snapshot: time since the last successful refresh,
    /// or zero while a healthy watch keeps it current.
    pub fn staleness(&self) -> Option<Duration> {
        self.state.staleness()
    }

    /// Last discovery error, if the most recent refresh failed.
    pub fn last_error(&self) -> Option<String> {
        self.state.last_error.read().clone()
    }

    /// Observability snapshot.
    pub fn status(&self) -> ResolverStatus {
        let current = self.current();
        ResolverStatus {
            service: self.state.service.clone(),
            source: self.state.source.name().to_string(),
            generation: current.as_ref().map(|set| set.generation()),
            endpoints: current
                .as_ref()
                .map(|set| set.endpoints().to_vec())
                .unwrap_or_default(),
            staleness: self.staleness(),
            last_error: self.last_error(),
            refreshes: self.state.refreshes.load(Ordering::Acquire),
        }
    }

    /// Stop the background task. The last snapshot stays readable.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            debug!(service = %self.state.service, "Stopping resolver");
            task.abort();
            self.state.end_watch();
        }
    }

    /// Whether the background task is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("service", &self.state.service)
            .field("source", &self.state.source.name())
            .field("generation", &self.current().map(|set| set.generation()))
            .finish()
    }
}
