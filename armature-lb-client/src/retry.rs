//! Retry budget and backoff.
//!
//! A retry never goes back to an endpoint that already failed for the same
//! request; the dispatcher re-selects from the remaining endpoints.

use crate::HttpClientError;
use std::time::Duration;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per request, the first one included.
    pub max_attempts: u32,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Status codes that count as a failed attempt and move on to another endpoint.
    pub retry_status_codes: Vec<u16>,
    /// Whether to retry on connection errors.
    pub retry_on_connection_error: bool,
    /// Whether to retry on timeout errors.
    pub retry_on_timeout: bool,
    /// Never make more attempts than there are endpoints.
    pub cap_to_endpoint_count: bool,
    /// Maximum total time for all attempts.
    pub max_retry_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(2),
                multiplier: 2.0,
            },
            retry_status_codes: vec![502, 503, 504],
            retry_on_connection_error: true,
            retry_on_timeout: true,
            cap_to_endpoint_count: true,
            max_retry_time: None,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with exponential backoff.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial: initial_delay,
                max: Duration::from_secs(30),
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    /// Create a retry config with linear backoff.
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Linear {
                delay,
                max: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    /// Create a retry config with constant delay.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Constant(delay),
            ..Default::default()
        }
    }

    /// Create a retry config with no delay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::None,
            ..Default::default()
        }
    }

    /// A single attempt, no retry.
    pub fn disabled() -> Self {
        Self::immediate(1)
    }

    /// Replace the retryable status codes.
    pub fn with_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_status_codes = codes;
        self
    }

    /// Disable retry on connection errors.
    pub fn no_retry_on_connection(mut self) -> Self {
        self.retry_on_connection_error = false;
        self
    }

    /// Disable retry on timeout errors.
    pub fn no_retry_on_timeout(mut self) -> Self {
        self.retry_on_timeout = false;
        self
    }

    /// Allow more attempts than endpoints. Once every endpoint has failed the
    /// exclusions are cleared and endpoints are tried again.
    pub fn uncapped(mut self) -> Self {
        self.cap_to_endpoint_count = false;
        self
    }

    /// Set maximum total retry time.
    pub fn with_max_retry_time(mut self, duration: Duration) -> Self {
        self.max_retry_time = Some(duration);
        self
    }

    /// Number of attempts allowed for a set of `endpoints` endpoints.
    pub fn attempt_budget(&self, endpoints: usize) -> u32 {
        let budget = self.max_attempts.max(1);
        if self.cap_to_endpoint_count {
            budget.min(u32::try_from(endpoints).unwrap_or(u32::MAX)).max(1)
        } else {
            budget
        }
    }

    /// Calculate delay before the given retry (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Constant delay between retries.
    Constant(Duration),
    /// Linear backoff: delay increases by a fixed amount.
    Linear {
        /// Delay increment per attempt.
        delay: Duration,
        /// Maximum delay.
        max: Duration,
    },
    /// Exponential backoff: delay doubles each attempt.
    Exponential {
        /// Initial delay.
        initial: Duration,
        /// Maximum delay.
        max: Duration,
        /// Multiplier (typically 2.0).
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear { delay, max } => {
                let total = delay.saturating_mul(attempt + 1);
                total.min(*max)
            }
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

/// Retry strategy trait for custom retry logic.
pub trait RetryStrategy: Send + Sync {
    /// Check if a failed attempt (1-based count so far) should be followed by another.
    fn should_retry(&self, attempt: u32, error: &HttpClientError) -> bool;

    /// Get the delay before the next retry.
    fn retry_delay(&self, attempt: u32) -> Duration;
}

impl RetryStrategy for RetryConfig {
    fn should_retry(&self, attempt: u32, error: &HttpClientError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        match error {
            HttpClientError::EndpointUnreachable { cause, .. } => {
                if cause.is_timeout() {
                    self.retry_on_timeout
                } else {
                    self.retry_on_connection_error
                }
            }
            HttpClientError::UnexpectedStatus { status, .. } => self.should_retry_status(*status),
            _ => false,
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.delay_for_attempt(attempt)
    }
}
