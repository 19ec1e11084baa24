//! Discovery and selection errors.

use std::time::Duration;
use thiserror::Error;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Service discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery source could not answer right now. The last known
    /// endpoint set stays in service.
    #[error("Discovery source '{source_name}' unavailable for '{service}': {message}")]
    SourceUnavailable {
        /// Name of the discovery source.
        source_name: String,
        /// Logical service name.
        service: String,
        /// Underlying failure.
        message: String,
    },

    /// No endpoint set was ever obtained for a service within the wait budget.
    #[error("Resolution unavailable for '{service}' after {waited:?}{}", cause_suffix(.last_error))]
    ResolutionUnavailable {
        /// Logical service name.
        service: String,
        /// How long the caller waited.
        waited: Duration,
        /// Last error reported by the source, if any.
        last_error: Option<String>,
    },

    /// The endpoint set is authoritatively empty (or every endpoint was excluded).
    #[error("No healthy endpoints for '{service}'")]
    NoHealthyEndpoints {
        /// Logical service name.
        service: String,
    },

    /// The registry or resolver was shut down.
    #[error("Resolver for '{0}' has been shut down")]
    Shutdown(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unknown load balancing strategy name.
    #[error("Unknown load balancing strategy: {0}")]
    UnknownStrategy(String),

    /// HTTP error while talking to a discovery backend.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed payload from a discovery backend.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (service-account files, DNS).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn cause_suffix(cause: &Option<String>) -> String {
    cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()
}

impl DiscoveryError {
    /// Create a source-unavailable error.
    pub fn unavailable(
        source_name: impl Into<String>,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.into(),
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a no-healthy-endpoints error.
    pub fn no_healthy_endpoints(service: impl Into<String>) -> Self {
        Self::NoHealthyEndpoints {
            service: service.into(),
        }
    }

    /// Whether this error means the source is temporarily unable to answer,
    /// as opposed to an authoritative or configuration failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::Http(_) | Self::Io(_) | Self::Json(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_unavailable_display() {
        let err = DiscoveryError::ResolutionUnavailable {
            service: "hello-node".to_string(),
            waited: Duration::from_secs(5),
            last_error: Some("connection refused".to_string()),
        };
        let display = err.to_string();
        assert!(display.contains("hello-node"));
        assert!(display.contains("connection refused"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DiscoveryError::unavailable("memory", "api", "boom").is_transient());
        assert!(!DiscoveryError::no_healthy_endpoints("api").is_transient());
        assert!(!DiscoveryError::Shutdown("api".to_string()).is_transient());
    }
}
