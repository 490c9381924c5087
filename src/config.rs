//! Middleware configuration.
//!
//! Every section has defaults, so an empty JSON document is a valid configuration apart
//! from the connection list.
//!
//! ```rust
//! use sproc_middleware::config::MiddlewareConfig;
//!
//! let cfg = MiddlewareConfig::from_json_str(
//!     r#"{ "connections": [ { "id": "main", "secret_name": "sql-main" } ],
//!          "retry": { "max_attempts": 5 } }"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.retry.max_attempts, 5);
//! assert_eq!(cfg.pool.max_size, 10);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::HostContext;
use crate::error::SprocError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub connections: Vec<ConnectionDefinition>,
    pub pool: PoolConfig,
    pub secrets: SecretCacheConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub marshalling: MarshallingConfig,
    pub execution: ExecutionConfig,
    pub audit: AuditConfig,
    pub host: HostContext,
}

/// A logical connection the middleware may open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    pub id: String,
    /// Name of the secret holding the connection string. Defaults to `id`.
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Overrides `pool.max_size` for this connection.
    #[serde(default)]
    pub pool_max_size: Option<usize>,
}

impl ConnectionDefinition {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret_name: None,
            pool_max_size: None,
        }
    }

    #[must_use]
    pub fn with_secret_name(mut self, secret_name: impl Into<String>) -> Self {
        self.secret_name = Some(secret_name.into());
        self
    }

    #[must_use]
    pub fn with_pool_max_size(mut self, max_size: usize) -> Self {
        self.pool_max_size = Some(max_size);
        self
    }

    #[must_use]
    pub fn secret_name(&self) -> &str {
        self.secret_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub wait_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            wait_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretCacheConfig {
    pub cache_ttl_secs: u64,
}

impl Default for SecretCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
        }
    }
}

impl SecretCacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a single trial call is admitted.
    pub cool_down_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarshallingConfig {
    /// Reject caller keys that match no declared parameter.
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Events held locally while the sink is unavailable.
    pub buffer_capacity: usize,
    /// Maximum events handed to the sink per write.
    pub batch_size: usize,
    /// Pause before retrying a failed sink write.
    pub retry_delay_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_size: 100,
            retry_delay_ms: 1_000,
        }
    }
}

impl AuditConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl MiddlewareConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    /// Returns `SprocError::Configuration` if the document is invalid.
    pub fn from_json_str(json: &str) -> Result<Self, SprocError> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| SprocError::Configuration(format!("invalid configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON configuration file.
    ///
    /// # Errors
    /// Returns `SprocError::Configuration` if the file cannot be read or is invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SprocError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SprocError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns `SprocError::Configuration` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), SprocError> {
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if conn.id.trim().is_empty() {
                return Err(SprocError::Configuration("connection id must not be empty".into()));
            }
            if !seen.insert(conn.id.as_str()) {
                return Err(SprocError::Configuration(format!(
                    "connection '{}' defined twice",
                    conn.id
                )));
            }
            if conn.pool_max_size == Some(0) {
                return Err(SprocError::Configuration(format!(
                    "connection '{}' pool size must be positive",
                    conn.id
                )));
            }
        }
        if self.pool.max_size == 0 {
            return Err(SprocError::Configuration("pool.max_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SprocError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SprocError::Configuration(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if let Some(cb) = &self.circuit_breaker
            && cb.failure_threshold == 0
        {
            return Err(SprocError::Configuration(
                "circuit_breaker.failure_threshold must be positive".into(),
            ));
        }
        if self.audit.buffer_capacity == 0 || self.audit.batch_size == 0 {
            return Err(SprocError::Configuration(
                "audit buffer capacity and batch size must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn connection(&self, id: &str) -> Option<&ConnectionDefinition> {
        self.connections.iter().find(|c| c.id == id)
    }

    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionDefinition) -> Self {
        self.connections.push(connection);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_secret_ttl(mut self, ttl: Duration) -> Self {
        self.secrets.cache_ttl_secs = ttl.as_secs();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn with_strict_parameters(mut self, strict: bool) -> Self {
        self.marshalling.strict = strict;
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.execution.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = host;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg = MiddlewareConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.execution.default_timeout(), Duration::from_secs(30));
        assert!(cfg.circuit_breaker.is_none());
        assert!(!cfg.marshalling.strict);
    }

    #[test]
    fn secret_name_defaults_to_id() {
        let cfg = MiddlewareConfig::from_json_str(
            r#"{"connections":[{"id":"a"},{"id":"b","secret_name":"vault-b"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.connection("a").unwrap().secret_name(), "a");
        assert_eq!(cfg.connection("b").unwrap().secret_name(), "vault-b");
        assert!(cfg.connection("c").is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(MiddlewareConfig::from_json_str(r#"{"retry":{"max_attempts":0}}"#).is_err());
        assert!(
            MiddlewareConfig::from_json_str(r#"{"connections":[{"id":"a"},{"id":"a"}]}"#)
                .is_err()
        );
        assert!(MiddlewareConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mw.json");
        std::fs::write(&path, r#"{"marshalling":{"strict":true}}"#).unwrap();
        let cfg = MiddlewareConfig::from_json_file(&path).unwrap();
        assert!(cfg.marshalling.strict);
    }
}
