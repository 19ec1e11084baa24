//! Load-balanced client configuration.

use crate::outlier::OutlierConfig;
use crate::retry::RetryConfig;
use crate::{HttpClientError, Result};
use armature_discovery::{LoadBalancingStrategy, RegistryConfig};
use std::collections::HashMap;
use std::time::Duration;

/// Prefix of the environment variables read by [`ClientConfig::from_env`].
pub const ENV_PREFIX: &str = "ARMATURE_LB";

/// Load-balanced client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheme used to reach endpoints.
    pub scheme: String,
    /// Default timeout of one attempt.
    pub timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Outlier detection, disabled when `None`.
    pub outlier: Option<OutlierConfig>,
    /// Strategy used for services without an override.
    pub strategy: LoadBalancingStrategy,
    /// Resolver registry configuration.
    pub registry: RegistryConfig,
    /// Idle timeout of pooled connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per endpoint.
    pub pool_max_idle_per_host: usize,
    /// Default headers for all requests.
    pub default_headers: Vec<(String, String)>,
    /// User agent string.
    pub user_agent: String,
    /// Enable gzip compression.
    pub gzip: bool,
    /// Enable brotli compression.
    pub brotli: bool,
    /// Follow redirects.
    pub follow_redirects: bool,
    /// Maximum redirects to follow.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            outlier: None,
            strategy: LoadBalancingStrategy::RoundRobin,
            registry: RegistryConfig::default(),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            default_headers: Vec::new(),
            user_agent: format!("armature-lb-client/{}", env!("CARGO_PKG_VERSION")),
            gzip: true,
            brotli: true,
            follow_redirects: true,
            max_redirects: 10,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Defaults overridden by `ARMATURE_LB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `ARMATURE_LB_*` entries of `vars`.
    ///
    /// Recognized keys (after the prefix): `SCHEME`, `STRATEGY`, `TIMEOUT_MS`,
    /// `CONNECT_TIMEOUT_MS`, `MAX_ATTEMPTS`, `RESOLVE_TIMEOUT_MS`,
    /// `REFRESH_INTERVAL_MS`, `IDLE_TIMEOUT_MS`, `USER_AGENT`,
    /// `OUTLIER_FAILURES`, `OUTLIER_EJECTION_MS`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let prefix = format!("{ENV_PREFIX}_");
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.as_ref()
                    .strip_prefix(&prefix)
                    .map(|k| (k.to_lowercase(), value.into()))
            })
            .collect();

        let mut builder = Self::builder();

        if let Some(scheme) = vars.get("scheme") {
            builder = builder.scheme(scheme.as_str());
        }
        if let Some(strategy) = vars.get("strategy") {
            builder = builder.strategy(strategy.parse()?);
        }
        if let Some(ms) = millis(&vars, "timeout_ms")? {
            builder = builder.timeout(ms);
        }
        if let Some(ms) = millis(&vars, "connect_timeout_ms")? {
            builder = builder.connect_timeout(ms);
        }
        if let Some(attempts) = number(&vars, "max_attempts")? {
            let mut retry = builder.config.retry.clone();
            retry.max_attempts = attempts;
            builder = builder.retry(retry);
        }
        if let Some(ms) = millis(&vars, "resolve_timeout_ms")? {
            builder = builder.resolve_timeout(ms);
        }
        if let Some(ms) = millis(&vars, "refresh_interval_ms")? {
            builder = builder.refresh_interval(ms);
        }
        if let Some(ms) = millis(&vars, "idle_timeout_ms")? {
            builder = builder.idle_timeout(ms);
        }
        if let Some(agent) = vars.get("user_agent") {
            builder = builder.user_agent(agent.as_str());
        }
        if let Some(failures) = number(&vars, "outlier_failures")? {
            let ejection = millis(&vars, "outlier_ejection_ms")?
                .unwrap_or(OutlierConfig::default().base_ejection);
            builder = builder.outlier(OutlierConfig::new(failures, ejection));
        }

        Ok(builder.build())
    }
}

fn number(vars: &HashMap<String, String>, key: &str) -> Result<Option<u32>> {
    vars.get(key)
        .map(|v| {
            v.trim().parse::<u32>().map_err(|e| {
                HttpClientError::InvalidConfiguration(format!(
                    "{ENV_PREFIX}_{}: {e}",
                    key.to_uppercase()
                ))
            })
        })
        .transpose()
}

fn millis(vars: &HashMap<String, String>, key: &str) -> Result<Option<Duration>> {
    Ok(number(vars, key)?.map(|ms| Duration::from_millis(u64::from(ms))))
}

/// Builder for client configuration.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the scheme used to reach endpoints (`http` or `https`).
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.config.scheme = scheme.into();
        self
    }

    /// Set the default timeout of one attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Enable outlier detection.
    pub fn outlier(mut self, config: OutlierConfig) -> Self {
        self.config.outlier = Some(config);
        self
    }

    /// Set the default load balancing strategy.
    pub fn strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the resolver registry configuration.
    pub fn registry(mut self, config: RegistryConfig) -> Self {
        self.config.registry = config;
        self
    }

    /// Set how long a request waits for the first resolution of a service.
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.resolve_timeout = timeout;
        self
    }

    /// Set the discovery polling interval.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.registry.resolver.refresh_interval = interval;
        self
    }

    /// Evict resolvers of services unused for this long.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.idle_timeout = Some(timeout);
        self
    }

    /// Set the connection pool idle timeout.
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    /// Set the maximum idle connections per endpoint.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_idle_per_host = max;
        self
    }

    /// Add a default header for all requests.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.push((name.into(), value.into()));
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Enable or disable gzip compression.
    pub fn gzip(mut self, enable: bool) -> Self {
        self.config.gzip = enable;
        self
    }

    /// Enable or disable brotli compression.
    pub fn brotli(mut self, enable: bool) -> Self {
        self.config.brotli = enable;
        self
    }

    /// Enable or disable following redirects.
    pub fn follow_redirects(mut self, enable: bool) -> Self {
        self.config.follow_redirects = enable;
        self
    }

    /// Set the maximum number of redirects to follow.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
