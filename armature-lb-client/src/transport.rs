//! HTTP transport boundary.
//!
//! The dispatcher only knows how to hand a request to a [`Transport`] for a
//! given endpoint. Pooling, TLS and compression are left to the transport;
//! the default one is backed by `reqwest`.

use crate::config::ClientConfig;
use crate::request::RequestSpec;
use crate::response::Response;
use crate::Result;
use armature_discovery::Endpoint;
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Failure of a single send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// No response within the request timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure (invalid URL, broken body, protocol error).
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether this is a connect failure.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Classify a `reqwest` error.
    pub fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout)
        } else if error.is_connect() {
            Self::Connect(error_chain(&error))
        } else {
            Self::Request(error_chain(&error))
        }
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Sends one request to one concrete endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `endpoint`. Any HTTP status is a successful send.
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &RequestSpec,
    ) -> std::result::Result<Response, TransportError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    inner: reqwest::Client,
    scheme: String,
    timeout: Duration,
    default_headers: HeaderMap,
}

impl ReqwestTransport {
    /// Build a transport from the client configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(&config.user_agent)
            .gzip(config.gzip)
            .brotli(config.brotli);

        if config.follow_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        } else {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }

        let mut default_headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| crate::HttpClientError::InvalidConfiguration(e.to_string()))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| crate::HttpClientError::InvalidConfiguration(e.to_string()))?;
            default_headers.insert(name, value);
        }

        Ok(Self {
            inner: builder.build()?,
            scheme: config.scheme.clone(),
            timeout: config.timeout,
            default_headers,
        })
    }

    /// Get the underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &RequestSpec,
    ) -> std::result::Result<Response, TransportError> {
        let url = request
            .url_for(endpoint, &self.scheme)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let timeout = request.timeout().unwrap_or(self.timeout);

        trace!(endpoint = %endpoint, method = %request.method(), url = %url, "Sending request");

        let mut headers = self.default_headers.clone();
        headers.extend(request.headers().clone());

        let mut builder = self
            .inner
            .request(request.method().clone(), url)
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout))?;

        Response::from_reqwest(response, endpoint.clone())
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout))
    }
}
