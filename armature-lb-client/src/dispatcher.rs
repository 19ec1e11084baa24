//! Request dispatch.
//!
//! One request goes through `Pending → Resolving → Selecting → Sending`, then
//! either `Succeeded`, `Failed`, or `Retrying → Selecting` on another
//! endpoint. An endpoint that failed is excluded for the rest of the request.

use crate::outlier::OutlierDetector;
use crate::request::RequestSpec;
use crate::response::Response;
use crate::retry::{RetryConfig, RetryStrategy};
use crate::transport::{Transport, TransportError};
use crate::{HttpClientError, Result};
use armature_discovery::{
    BalancerCursor, Endpoint, EndpointSet, LoadBalancer, OutcomeKind, ResolverRegistry,
    SelectionOutcome,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Lifecycle of one dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Not started.
    Pending,
    /// Waiting for the endpoint set.
    Resolving,
    /// Picking an endpoint.
    Selecting,
    /// Waiting for the endpoint to answer.
    Sending,
    /// Attempt failed, another endpoint will be tried.
    Retrying,
    /// A response was returned.
    Succeeded,
    /// An error was returned.
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Selecting => "selecting",
            Self::Sending => "sending",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct Transitions<'a> {
    service: &'a str,
    state: DispatchState,
}

impl<'a> Transitions<'a> {
    fn new(service: &'a str) -> Self {
        Self {
            service,
            state: DispatchState::Pending,
        }
    }

    fn to(&mut self, next: DispatchState) {
        trace!(service = %self.service, from = %self.state, to = %next, "Dispatch transition");
        self.state = next;
    }

    fn fail(&mut self, error: HttpClientError) -> HttpClientError {
        self.to(DispatchState::Failed);
        error
    }
}

/// An attempt in flight. Reports a failure if dropped before completion,
/// so cancelled requests do not leak pending counts.
struct InFlight<'a> {
    balancer: &'a dyn LoadBalancer,
    cursor: &'a BalancerCursor,
    endpoint: Endpoint,
    started: Instant,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn start(balancer: &'a dyn LoadBalancer, cursor: &'a BalancerCursor, endpoint: Endpoint) -> Self {
        balancer.on_dispatch(&endpoint, cursor);
        Self {
            balancer,
            cursor,
            endpoint,
            started: Instant::now(),
            done: false,
        }
    }

    fn complete(&mut self, kind: OutcomeKind) {
        if self.done {
            return;
        }
        self.done = true;
        let outcome = SelectionOutcome::new(self.endpoint.clone(), kind, self.started.elapsed());
        self.balancer.report(&outcome, self.cursor);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.complete(OutcomeKind::Failure);
    }
}

/// Sends requests to the endpoints of logical services.
pub struct Dispatcher {
    registry: Arc<ResolverRegistry>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    outlier: Option<Arc<OutlierDetector>>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<ResolverRegistry>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        outlier: Option<Arc<OutlierDetector>>,
    ) -> Self {
        Self {
            registry,
            transport,
            retry,
            outlier,
        }
    }

    /// Retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Outlier detector, when enabled.
    pub fn outlier(&self) -> Option<&Arc<OutlierDetector>> {
        self.outlier.as_ref()
    }

    /// Endpoints eligible for the next attempt, or `None` when every endpoint
    /// of `set` is.
    fn candidates(&self, set: &EndpointSet, excluded: &HashSet<String>) -> Option<EndpointSet> {
        let mut skip = excluded.clone();

        if let Some(outlier) = &self.outlier {
            let ejected = outlier.ejected(set);
            if !ejected.is_empty() {
                let remaining = set
                    .iter()
                    .map(Endpoint::authority)
                    .filter(|a| !skip.contains(a) && !ejected.contains(a))
                    .count();
                if remaining > 0 {
                    skip.extend(ejected);
                } else {
                    debug!(
                        service = %set.service(),
                        "Every remaining endpoint is ejected, ignoring ejections"
                    );
                }
            }
        }

        if skip.is_empty() {
            None
        } else {
            Some(set.excluding(&skip))
        }
    }

    /// Send `request` to one endpoint of `service`, retrying on other
    /// endpoints within the retry budget.
    pub async fn dispatch(
        &self,
        service: &str,
        balancer: &dyn LoadBalancer,
        request: &RequestSpec,
    ) -> Result<Response> {
        let mut state = Transitions::new(service);
        request.validate().map_err(|e| state.fail(e))?;

        state.to(DispatchState::Resolving);
        let entry = self.registry.entry(service).map_err(|e| state.fail(e.into()))?;
        let set = entry
            .resolver()
            .wait_ready(self.registry.config().resolve_timeout)
            .await
            .map_err(|e| state.fail(e.into()))?;
        let cursor = entry.cursor(balancer.name());

        let budget = self.retry.attempt_budget(set.len());
        let started = Instant::now();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempts: u32 = 0;

        loop {
            state.to(DispatchState::Selecting);

            if !set.is_empty() && set.iter().all(|e| excluded.contains(&e.authority())) {
                // Only reachable with an uncapped budget
                excluded.clear();
            }
            let view = self.candidates(&set, &excluded);
            let endpoint = balancer
                .select(view.as_ref().unwrap_or(&*set), &cursor)
                .map_err(|e| state.fail(e.into()))?
                .clone();

            attempts += 1;
            state.to(DispatchState::Sending);
            trace!(
                service = %service,
                endpoint = %endpoint,
                attempt = attempts,
                generation = set.generation(),
                "Selected endpoint"
            );

            let mut in_flight = InFlight::start(balancer, &cursor, endpoint.clone());
            let result = self.transport.send(&endpoint, request).await;

            let error = match result {
                Ok(response) if self.retry.should_retry_status(response.status().as_u16()) => {
                    in_flight.complete(OutcomeKind::Failure);
                    self.record_failure(service, &endpoint);
                    HttpClientError::UnexpectedStatus {
                        service: service.to_string(),
                        endpoint: endpoint.clone(),
                        status: response.status().as_u16(),
                    }
                }
                Ok(response) => {
                    in_flight.complete(OutcomeKind::Success);
                    if let Some(outlier) = &self.outlier {
                        outlier.record_success(service, &endpoint);
                    }
                    state.to(DispatchState::Succeeded);
                    return Ok(response.with_attempts(attempts));
                }
                Err(cause @ (TransportError::Connect(_) | TransportError::Timeout(_))) => {
                    let kind = if cause.is_timeout() {
                        OutcomeKind::Timeout
                    } else {
                        OutcomeKind::Failure
                    };
                    in_flight.complete(kind);
                    self.record_failure(service, &endpoint);
                    HttpClientError::EndpointUnreachable {
                        service: service.to_string(),
                        endpoint: endpoint.clone(),
                        cause,
                    }
                }
                Err(cause) => {
                    in_flight.complete(OutcomeKind::Failure);
                    return Err(state.fail(HttpClientError::Transport {
                        service: service.to_string(),
                        endpoint: endpoint.clone(),
                        cause,
                    }));
                }
            };

            if !self.retry.should_retry(attempts, &error) {
                if error.is_retryable() {
                    return Err(state.fail(self.exhausted(service, attempts, error)));
                }
                return Err(state.fail(error));
            }

            let out_of_time = self
                .retry
                .max_retry_time
                .is_some_and(|max| started.elapsed() >= max);
            if attempts >= budget || out_of_time {
                return Err(state.fail(self.exhausted(service, attempts, error)));
            }

            state.to(DispatchState::Retrying);
            debug!(
                service = %service,
                endpoint = %endpoint,
                attempt = attempts,
                error = %error,
                "Retrying request on another endpoint"
            );
            excluded.insert(endpoint.authority());

            let delay = self.retry.retry_delay(attempts - 1);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn record_failure(&self, service: &str, endpoint: &Endpoint) {
        if let Some(outlier) = &self.outlier {
            outlier.record_failure(service, endpoint);
        }
    }

    fn exhausted(&self, service: &str, attempts: u32, last: HttpClientError) -> HttpClientError {
        debug!(service = %service, attempts, error = %last, "Retry budget exhausted");
        HttpClientError::RetryBudgetExhausted {
            service: service.to_string(),
            attempts,
            last: Box::new(last),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("outlier", &self.outlier.is_some())
            .finish()
    }
}
