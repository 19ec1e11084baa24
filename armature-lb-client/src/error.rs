//! Load-balanced client error types.

use crate::transport::TransportError;
use armature_discovery::{DiscoveryError, Endpoint};
use std::time::Duration;
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, HttpClientError>;

/// Load-balanced HTTP client errors.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// No endpoint set was ever obtained within the first-resolution timeout.
    #[error("Service '{service}' could not be resolved within {waited:?}")]
    ResolutionUnavailable {
        /// Logical service name.
        service: String,
        /// How long the request waited.
        waited: Duration,
        /// Underlying discovery failure.
        #[source]
        cause: DiscoveryError,
    },

    /// The endpoint set is empty, or every endpoint was excluded. Nothing was sent.
    #[error("No healthy endpoints for service '{service}'")]
    NoHealthyEndpoints {
        /// Logical service name.
        service: String,
    },

    /// Connect or timeout failure on one endpoint.
    #[error("Endpoint {endpoint} of '{service}' is unreachable")]
    EndpointUnreachable {
        /// Logical service name.
        service: String,
        /// Endpoint that failed.
        endpoint: Endpoint,
        /// Transport failure.
        #[source]
        cause: TransportError,
    },

    /// An endpoint answered with a status configured as retryable.
    #[error("Endpoint {endpoint} of '{service}' answered {status}")]
    UnexpectedStatus {
        /// Logical service name.
        service: String,
        /// Endpoint that answered.
        endpoint: Endpoint,
        /// HTTP status code.
        status: u16,
    },

    /// Every attempt allowed by the retry budget failed.
    #[error("Request to '{service}' failed after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Logical service name.
        service: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        last: Box<HttpClientError>,
    },

    /// The request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Non-retryable transport failure.
    #[error("Request to {endpoint} of '{service}' failed")]
    Transport {
        /// Logical service name.
        service: String,
        /// Endpoint the request was sent to.
        endpoint: Endpoint,
        /// Transport failure.
        #[source]
        cause: TransportError,
    },

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The client was shut down.
    #[error("Client has been shut down")]
    Shutdown,

    /// Discovery failure other than the ones above.
    #[error("Discovery error: {0}")]
    Discovery(#[source] DiscoveryError),

    /// Response error.
    #[error("Response error: {status} - {message}")]
    Response {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Response body is not valid text.
    #[error("Body decode error: {0}")]
    Decode(String),

    /// Underlying HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl From<DiscoveryError> for HttpClientError {
    fn from(error: DiscoveryError) -> Self {
        match error {
            DiscoveryError::ResolutionUnavailable {
                ref service,
                waited,
                ..
            } => Self::ResolutionUnavailable {
                service: service.clone(),
                waited,
                cause: error,
            },
            DiscoveryError::NoHealthyEndpoints { service } => Self::NoHealthyEndpoints { service },
            DiscoveryError::Shutdown(_) => Self::Shutdown,
            other => Self::Discovery(other),
        }
    }
}

impl HttpClientError {
    /// Check if this error is retryable on another endpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EndpointUnreachable { .. } | Self::UnexpectedStatus { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::EndpointUnreachable { cause, .. } => cause.is_timeout(),
            Self::RetryBudgetExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// Check if this is a connection error.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::EndpointUnreachable { cause, .. } => cause.is_connect(),
            Self::RetryBudgetExhausted { last, .. } => last.is_connection(),
            _ => false,
        }
    }

    /// Get the HTTP status code if this is a response error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } | Self::Response { status, .. } => Some(*status),
            Self::RetryBudgetExhausted { last, .. } => last.status_code(),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Logical service name the error relates to, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::ResolutionUnavailable { service, .. }
            | Self::NoHealthyEndpoints { service }
            | Self::EndpointUnreachable { service, .. }
            | Self::UnexpectedStatus { service, .. }
            | Self::RetryBudgetExhausted { service, .. }
            | Self::Transport { service, .. } => Some(service),
            _ => None,
        }
    }

    /// Endpoint the error relates to, if any.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            Self::EndpointUnreachable { endpoint, .. }
            | Self::UnexpectedStatus { endpoint, .. }
            | Self::Transport { endpoint, .. } => Some(endpoint),
            Self::RetryBudgetExhausted { last, .. } => last.endpoint(),
            _ => None,
        }
    }
}
