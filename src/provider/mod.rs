//! Connection provider: logical connection id → pooled, ready-to-use connection.
//!
//! - `secrets`: secret resolution and the TTL cache in front of it

mod secrets;

pub use secrets::{EnvSecretResolver, SecretCache, SecretResolver, StaticSecretResolver};

use std::collections::HashMap;
use std::sync::Arc;

use deadpool::Runtime;
use deadpool::managed::{Pool, PoolError, Status, TimeoutType};
use parking_lot::RwLock;

use crate::backend::ConnectionFactory;
use crate::config::{ConnectionDefinition, MiddlewareConfig, PoolConfig};
use crate::error::{DatabaseError, SprocError};
use crate::pool::{ConnectionManager, ConnectionPool, PooledConnection};

struct PoolEntry {
    pool: ConnectionPool,
    // Connection string the pool was built from; a rotated secret replaces the pool.
    connection_string: String,
}

/// Hands out pooled connections by logical connection id.
///
/// One pool exists per connection id, created on first use. Connection strings come from
/// the [`SecretResolver`] through a TTL cache; when the cached secret is refreshed and has
/// changed, the pool is rebuilt with the new string.
pub struct ConnectionProvider {
    definitions: HashMap<String, ConnectionDefinition>,
    pool_config: PoolConfig,
    resolver: Arc<dyn SecretResolver>,
    factory: Arc<dyn ConnectionFactory>,
    secrets: SecretCache,
    pools: RwLock<HashMap<String, PoolEntry>>,
}

impl ConnectionProvider {
    #[must_use]
    pub fn new(
        config: &MiddlewareConfig,
        resolver: Arc<dyn SecretResolver>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            definitions: config
                .connections
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
            pool_config: config.pool.clone(),
            resolver,
            factory,
            secrets: SecretCache::new(config.secrets.ttl()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `connection_id` is configured.
    #[must_use]
    pub fn knows(&self, connection_id: &str) -> bool {
        self.definitions.contains_key(connection_id)
    }

    /// Check out a connection for `connection_id`.
    ///
    /// The connection returns to its pool when dropped.
    ///
    /// # Errors
    /// - `SprocError::Configuration` if the id is unknown,
    /// - `SprocError::SecretUnavailable` if the connection string cannot be resolved,
    /// - `SprocError::Connectivity` if the connection cannot be established or the pool
    ///   wait times out. In that case the cached secret and the pool are dropped so the
    ///   next attempt starts from a fresh secret.
    pub async fn acquire(&self, connection_id: &str) -> Result<PooledConnection, SprocError> {
        let definition = self.definitions.get(connection_id).ok_or_else(|| {
            SprocError::Configuration(format!("unknown connection id '{connection_id}'"))
        })?;
        let (pool, connection_string) = self.pool_for(definition).await?;

        match pool.get().await {
            Ok(conn) => {
                tracing::debug!(connection_id, "connection checked out");
                Ok(PooledConnection::new(conn, Arc::from(connection_id)))
            }
            Err(PoolError::Timeout(TimeoutType::Wait)) => {
                // Saturation: every connection is busy. The pool itself is healthy.
                let status = pool.status();
                tracing::warn!(
                    connection_id,
                    max_size = status.max_size,
                    waiting = status.waiting,
                    "no pooled connection became free in time"
                );
                Err(SprocError::Database(DatabaseError::timeout(format!(
                    "timed out waiting for a pooled connection to '{connection_id}' ({} in use)",
                    status.size
                ))))
            }
            Err(err) => {
                let unreachable = matches!(
                    err,
                    PoolError::Timeout(TimeoutType::Create)
                        | PoolError::Backend(
                            SprocError::Connectivity(_) | SprocError::Configuration(_)
                        )
                );
                let err = map_pool_error(err);
                if unreachable {
                    tracing::warn!(
                        connection_id,
                        error = %err.detailed_message(),
                        "connection checkout failed; dropping cached secret and pool"
                    );
                    self.secrets.invalidate(definition.secret_name());
                    self.evict_stale(connection_id, &connection_string);
                }
                Err(err)
            }
        }
    }

    /// Close and forget the pool for `connection_id`.
    ///
    /// Connections already checked out stay usable and are closed when returned.
    pub fn evict(&self, connection_id: &str) {
        if let Some(entry) = self.pools.write().remove(connection_id) {
            entry.pool.close();
        }
    }

    // Evict only the pool built from `connection_string`; a replacement built by another
    // task after a rotation stays.
    fn evict_stale(&self, connection_id: &str, connection_string: &str) {
        let mut pools = self.pools.write();
        if pools
            .get(connection_id)
            .is_some_and(|entry| entry.connection_string == connection_string)
            && let Some(entry) = pools.remove(connection_id)
        {
            entry.pool.close();
        }
    }

    /// Pool occupancy for `connection_id`, if its pool exists.
    #[must_use]
    pub fn pool_status(&self, connection_id: &str) -> Option<Status> {
        self.pools
            .read()
            .get(connection_id)
            .map(|entry| entry.pool.status())
    }

    async fn pool_for(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<(ConnectionPool, String), SprocError> {
        let connection_string = self
            .secrets
            .get_or_resolve(definition.secret_name(), self.resolver.as_ref())
            .await?;

        if let Some(entry) = self.pools.read().get(&definition.id)
            && entry.connection_string == connection_string
        {
            return Ok((entry.pool.clone(), connection_string));
        }

        let pool = self.build_pool(definition, connection_string.clone())?;
        let mut pools = self.pools.write();
        match pools.get(&definition.id) {
            // Another task built the same pool while we were resolving.
            Some(entry) if entry.connection_string == connection_string => {
                Ok((entry.pool.clone(), connection_string))
            }
            _ => {
                tracing::debug!(connection_id = %definition.id, "creating connection pool");
                if let Some(old) = pools.insert(
                    definition.id.clone(),
                    PoolEntry {
                        pool: pool.clone(),
                        connection_string: connection_string.clone(),
                    },
                ) {
                    old.pool.close();
                }
                Ok((pool, connection_string))
            }
        }
    }

    fn build_pool(
        &self,
        definition: &ConnectionDefinition,
        connection_string: String,
    ) -> Result<ConnectionPool, SprocError> {
        let manager = ConnectionManager::new(
            Arc::from(definition.id.as_str()),
            connection_string,
            self.factory.clone(),
        );
        let wait = Some(self.pool_config.wait_timeout());
        Pool::builder(manager)
            .max_size(definition.pool_max_size.unwrap_or(self.pool_config.max_size))
            .wait_timeout(wait)
            .create_timeout(wait)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                SprocError::Configuration(format!(
                    "failed to create pool for '{}': {e}",
                    definition.id
                ))
            })
    }
}

fn map_pool_error(err: PoolError<SprocError>) -> SprocError {
    match err {
        PoolError::Backend(err) => err,
        other => SprocError::Connectivity(format!("connection pool error: {other}")),
    }
}
