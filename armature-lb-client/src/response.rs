//! HTTP response wrapper.

use crate::{HttpClientError, Result};
use armature_discovery::Endpoint;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

/// HTTP response, tagged with the endpoint that served it.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    url: Option<url::Url>,
    endpoint: Endpoint,
    attempts: u32,
}

impl Response {
    /// Create a response served by `endpoint`.
    pub fn new(endpoint: Endpoint, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            url: None,
            endpoint,
            attempts: 1,
        }
    }

    /// Set the response headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Read a reqwest response fully.
    pub(crate) async fn from_reqwest(
        response: reqwest::Response,
        endpoint: Endpoint,
    ) -> std::result::Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        Ok(Self {
            status,
            headers,
            body,
            url: Some(url),
            endpoint,
            attempts: 1,
        })
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Endpoint that served this response.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of attempts it took, including this one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Check if the response was successful (2xx).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response was a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Get the final request URL, when sent over HTTP.
    pub fn url(&self) -> Option<&url::Url> {
        self.url.as_ref()
    }

    /// Get the response body as bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body as bytes.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Get the response body as text.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(|e| HttpClientError::Decode(e.to_string()))
    }

    /// Parse the response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| HttpClientError::Json(e.to_string()))
    }

    /// Get the content type if available.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Check for an error response and return it.
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            let message = self.text().unwrap_or_else(|_| "Unknown error".to_string());
            Err(HttpClientError::Response {
                status: self.status.as_u16(),
                message,
            })
        } else {
            Ok(self)
        }
    }
}
