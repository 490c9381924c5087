use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SprocError;

/// Source of connection strings, typically an external secret vault.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// # Errors
    /// Returns `SprocError::SecretUnavailable` when the secret cannot be retrieved.
    async fn resolve(&self, secret_name: &str) -> Result<String, SprocError>;
}

/// Resolver backed by a fixed map, for tests and local development.
#[derive(Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, String>,
}

impl StaticSecretResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, secret_name: &str) -> Result<String, SprocError> {
        self.secrets
            .get(secret_name)
            .cloned()
            .ok_or_else(|| SprocError::SecretUnavailable(format!("no secret named '{secret_name}'")))
    }
}

/// Resolver reading `<prefix><SECRET_NAME>` from the environment, with `-` and `.`
/// mapped to `_`.
#[derive(Debug, Clone)]
pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn variable_name(&self, secret_name: &str) -> String {
        let suffix: String = secret_name
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{suffix}", self.prefix)
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, secret_name: &str) -> Result<String, SprocError> {
        let var = self.variable_name(secret_name);
        std::env::var(&var)
            .map_err(|_| SprocError::SecretUnavailable(format!("environment variable {var} not set")))
    }
}

struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

/// TTL cache in front of a [`SecretResolver`].
pub struct SecretCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedSecret>>,
}

impl SecretCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached value if present and younger than the TTL.
    #[must_use]
    pub fn get(&self, secret_name: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(secret_name)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, secret_name: &str, value: String) {
        self.entries.lock().insert(
            secret_name.to_string(),
            CachedSecret {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop an entry before its TTL expires.
    pub fn invalidate(&self, secret_name: &str) {
        self.entries.lock().remove(secret_name);
    }

    /// Cached value, or a fresh one from `resolver` (which is then cached).
    ///
    /// # Errors
    /// Propagates the resolver's error; failures are not cached.
    pub async fn get_or_resolve(
        &self,
        secret_name: &str,
        resolver: &dyn SecretResolver,
    ) -> Result<String, SprocError> {
        if let Some(value) = self.get(secret_name) {
            tracing::debug!(secret = secret_name, "secret cache hit");
            return Ok(value);
        }
        tracing::debug!(secret = secret_name, "secret cache miss");
        match resolver.resolve(secret_name).await {
            Ok(value) => {
                self.insert(secret_name, value.clone());
                Ok(value)
            }
            Err(err) => {
                self.invalidate(secret_name);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretResolver for CountingResolver {
        async fn resolve(&self, secret_name: &str) -> Result<String, SprocError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{secret_name}-{n}"))
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn caches_until_invalidated() {
        let resolver = CountingResolver {
            calls: AtomicUsize::new(0),
        };
        let cache = SecretCache::new(Duration::from_secs(60));
        assert_eq!(cache.get_or_resolve("db", &resolver).await.unwrap(), "db-0");
        assert_eq!(cache.get_or_resolve("db", &resolver).await.unwrap(), "db-0");
        cache.invalidate("db");
        assert_eq!(cache.get_or_resolve("db", &resolver).await.unwrap(), "db-1");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_ttl_always_resolves() {
        let resolver = CountingResolver {
            calls: AtomicUsize::new(0),
        };
        let cache = SecretCache::new(Duration::ZERO);
        cache.get_or_resolve("db", &resolver).await.unwrap();
        cache.get_or_resolve("db", &resolver).await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn static_and_env_resolvers() {
        let r = StaticSecretResolver::new().with_secret("main", "Server=x");
        assert_eq!(r.resolve("main").await.unwrap(), "Server=x");
        assert!(matches!(
            r.resolve("other").await,
            Err(SprocError::SecretUnavailable(_))
        ));

        let env = EnvSecretResolver::new("SPROC_MW_TEST_");
        assert_eq!(env.variable_name("sql-main.ro"), "SPROC_MW_TEST_SQL_MAIN_RO");
        assert!(env.resolve("definitely-not-set-anywhere").await.is_err());
    }
}
