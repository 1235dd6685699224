//! Configuration management for Ratewall.
//!
//! Settings are layered with the `config` crate: an optional YAML file,
//! then `RATEWALL__`-prefixed environment variables using `__` between
//! nesting levels (`RATEWALL__LIMITS__IP__MAX_REQUESTS=5`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewallError, Result};
use crate::ratelimit::{LimitPolicy, LimitRule, TokenRule};

/// Prefix of environment variables read by [`RatewallConfig::load`].
pub const ENV_PREFIX: &str = "RATEWALL";

/// Main configuration for the Ratewall service.
///
/// `server` and `store` fall back to defaults; `limits` must be present
/// because the address limit has no default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatewallConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counting store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limits
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Time given to in-flight requests once shutdown starts
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_shutdown_timeout() -> u64 {
    5
}

/// Which counting store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    Memory,
    /// Counters shared through Redis
    #[default]
    Redis,
}

/// Counting store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Bound on each counting store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Bound on the startup connectivity check in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Interval between sweeps of expired in-memory counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_store_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    /// Bound on each counting store call.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Bound on the startup connectivity check.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Interval between sweeps of expired in-memory counters.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_store_timeout() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Request header carrying the API credential
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Limit for requests identified by client address (required)
    pub ip: LimitRule,

    /// Limits for known credentials
    #[serde(default)]
    pub tokens: Vec<TokenRule>,
}

fn default_credential_header() -> String {
    "API_KEY".to_string()
}

impl RatewallConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RatewallConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewallConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(RatewallError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Memory && self.store.sweep_interval_secs == 0 {
            return Err(RatewallError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if axum::http::HeaderName::try_from(self.limits.credential_header.as_str()).is_err() {
            return Err(RatewallError::Config(format!(
                "limits.credential_header is not a valid header name: {:?}",
                self.limits.credential_header
            )));
        }
        self.policy().map(|_| ())
    }

    /// Build the validated limit policy.
    pub fn policy(&self) -> Result<LimitPolicy> {
        LimitPolicy::from_rules(&self.limits.ip, &self.limits.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let yaml = r#"
limits:
  ip:
    max_requests: 5
    window: 1s
"#;
        let config = RatewallConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://localhost:6379");
        assert_eq!(config.store.timeout(), Duration::from_millis(500));
        assert_eq!(config.limits.credential_header, "API_KEY");
        assert!(config.limits.tokens.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen_addr: 127.0.0.1:9000
store:
  backend: memory
  timeout_ms: 250
limits:
  credential_header: X-Api-Key
  ip:
    max_requests: 5
    window: 1s
  tokens:
    - token: token-A
      max_requests: 10
      window: 2s
    - token: token-B
      max_requests: 2
      window: 3s
"#;
        let config = RatewallConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));

        let policy = config.policy().unwrap();
        assert_eq!(policy.default_ip().max_requests(), 5);
        assert_eq!(policy.default_ip().window(), Duration::from_secs(1));
        let token_b = policy.token_limit("token-B").unwrap();
        assert_eq!(token_b.max_requests(), 2);
        assert_eq!(token_b.window(), Duration::from_secs(3));
    }

    #[test]
    fn test_example_config_parses() {
        let config = RatewallConfig::from_yaml(include_str!("../ratewall.example.yaml")).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.limits.tokens.len(), 2);
        assert_eq!(config.policy().unwrap().default_ip().max_requests(), 5);
    }

    #[test]
    fn test_missing_ip_limit_fails_at_load() {
        let err = RatewallConfig::from_yaml("store:\n  backend: memory\n").unwrap_err();
        assert!(matches!(err, RatewallError::Config(_)));
    }

    #[test]
    fn test_missing_ip_limit_fields_fail_at_load() {
        let without_window = r#"
limits:
  ip:
    max_requests: 5
"#;
        let err = RatewallConfig::from_yaml(without_window).unwrap_err();
        assert!(matches!(err, RatewallError::Config(_)));

        let without_max_requests = r#"
limits:
  ip:
    window: 1s
"#;
        let err = RatewallConfig::from_yaml(without_max_requests).unwrap_err();
        assert!(matches!(err, RatewallError::Config(_)));
    }

    #[test]
    fn test_load_without_file_requires_limits() {
        if std::env::vars().any(|(key, _)| key.starts_with("RATEWALL__LIMITS__IP")) {
            return;
        }
        let err = RatewallConfig::load(None).unwrap_err();
        assert!(matches!(err, RatewallError::Config(_)));
    }

    #[test]
    fn test_negative_limit_fails_at_load() {
        let yaml = r#"
limits:
  ip:
    max_requests: -1
    window: 1s
"#;
        let err = RatewallConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RatewallError::Config(_)));
    }

    #[test]
    fn test_invalid_window_fails_at_load() {
        let yaml = r#"
limits:
  ip:
    max_requests: 5
    window: 1s
  tokens:
    - token: token-A
      max_requests: 3
      window: soon
"#;
        assert!(RatewallConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_header_name_fails_at_load() {
        let yaml = r#"
limits:
  credential_header: "bad header"
  ip:
    max_requests: 5
    window: 1s
"#;
        assert!(RatewallConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_store_timeout_fails_at_load() {
        let yaml = r#"
store:
  timeout_ms: 0
limits:
  ip:
    max_requests: 5
    window: 1s
"#;
        assert!(RatewallConfig::from_yaml(yaml).is_err());
    }
}
