//! Request description and builder.

use crate::{HttpClientError, LoadBalancedClient, Response, Result};
use armature_discovery::Endpoint;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::time::Duration;

/// A request addressed to a logical service rather than a host.
///
/// The same spec is sent to a different endpoint on every attempt, so the
/// body is held as [`Bytes`] and cloned cheaply.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    invalid: Option<String>,
}

impl RequestSpec {
    /// Create a request for `path` on whichever endpoint gets selected.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };

        Self {
            method,
            path,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
            invalid: None,
        }
    }

    /// GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Query parameters.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Request body.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Add a header to the request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => self.invalid = Some(format!("invalid header '{name}'")),
        }
        self
    }

    /// Add multiple headers to the request.
    pub fn headers_from(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add multiple query parameters.
    pub fn queries<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in params {
            self.query.push((k.into(), v.into()));
        }
        self
    }

    /// Set the request body as raw bytes.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the request body as text.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = Some(Bytes::from(text.into()));
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize>(mut self, json: &T) -> Self {
        match serde_json::to_vec(json) {
            Ok(bytes) => {
                self.headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                self.body = Some(Bytes::from(bytes));
            }
            Err(e) => self.invalid = Some(format!("failed to serialize JSON body: {e}")),
        }
        self
    }

    /// Set the request body as form data.
    pub fn form<T: Serialize>(mut self, form: &T) -> Self {
        match serde_urlencoded::to_string(form) {
            Ok(encoded) => {
                self.headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
                self.body = Some(Bytes::from(encoded));
            }
            Err(e) => self.invalid = Some(format!("failed to encode form data: {e}")),
        }
        self
    }

    /// Set a custom timeout for each attempt of this request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set bearer authentication.
    pub fn bearer_auth(self, token: impl Into<String>) -> Self {
        self.header("Authorization", format!("Bearer {}", token.into()))
    }

    /// Set basic authentication.
    pub fn basic_auth(
        self,
        username: impl Into<String>,
        password: Option<impl Into<String>>,
    ) -> Self {
        use base64::Engine;
        let credentials = match password {
            Some(p) => format!("{}:{}", username.into(), p.into()),
            None => format!("{}:", username.into()),
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        self.header("Authorization", format!("Basic {encoded}"))
    }

    /// Fail if a builder step recorded an error.
    pub fn validate(&self) -> Result<()> {
        match &self.invalid {
            Some(reason) => Err(HttpClientError::InvalidRequest(reason.clone())),
            None => Ok(()),
        }
    }

    /// Absolute URL of this request on `endpoint`.
    pub fn url_for(&self, endpoint: &Endpoint, scheme: &str) -> std::result::Result<url::Url, url::ParseError> {
        let mut url = url::Url::parse(&endpoint.base_url(scheme))?.join(&self.path)?;

        if !self.query.is_empty() {
            let mut query_pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                query_pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

/// Builder for a request to a logical service, sent through a
/// [`LoadBalancedClient`].
pub struct RequestBuilder<'a> {
    client: &'a LoadBalancedClient,
    service: String,
    spec: RequestSpec,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(
        client: &'a LoadBalancedClient,
        service: impl Into<String>,
        method: Method,
        path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            service: service.into(),
            spec: RequestSpec::new(method, path),
        }
    }

    /// Add a header to the request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec = self.spec.header(name, value);
        self
    }

    /// Add multiple headers to the request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.spec = self.spec.headers_from(headers);
        self
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec = self.spec.query(key, value);
        self
    }

    /// Add multiple query parameters.
    pub fn queries<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.spec = self.spec.queries(params);
        self
    }

    /// Set the request body as raw bytes.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.spec = self.spec.with_body(body);
        self
    }

    /// Set the request body as text.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.spec = self.spec.text(text);
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize>(mut self, json: &T) -> Self {
        self.spec = self.spec.json(json);
        self
    }

    /// Set the request body as form data.
    pub fn form<T: Serialize>(mut self, form: &T) -> Self {
        self.spec = self.spec.form(form);
        self
    }

    /// Set a custom timeout for each attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec = self.spec.with_timeout(timeout);
        self
    }

    /// Set bearer authentication.
    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.spec = self.spec.bearer_auth(token);
        self
    }

    /// Set basic authentication.
    pub fn basic_auth(
        mut self,
        username: impl Into<String>,
        password: Option<impl Into<String>>,
    ) -> Self {
        self.spec = self.spec.basic_auth(username, password);
        self
    }

    /// The request built so far.
    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    /// Send the request.
    pub async fn send(self) -> Result<Response> {
        self.client.request(&self.service, self.spec).await
    }
}
