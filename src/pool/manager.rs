use std::fmt;
use std::sync::Arc;

use deadpool::managed::{Manager, Metrics, Pool, RecycleError, RecycleResult};

use crate::backend::{ConnectionFactory, DbConnection};
use crate::error::SprocError;

/// Pool of connections for one connection identifier.
pub type ConnectionPool = Pool<ConnectionManager>;

/// Deadpool manager creating connections through a [`ConnectionFactory`].
pub struct ConnectionManager {
    connection_id: Arc<str>,
    connection_string: String,
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        connection_id: Arc<str>,
        connection_string: String,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            connection_id,
            connection_string,
            factory,
        }
    }
}

// Manual Debug so the connection string never reaches a log line.
impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_id", &self.connection_id)
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

impl Manager for ConnectionManager {
    type Type = Box<dyn DbConnection>;
    type Error = SprocError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        tracing::debug!(connection_id = %self.connection_id, "opening connection");
        self.factory.connect(&self.connection_string).await
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _metrics: &Metrics,
    ) -> RecycleResult<Self::Error> {
        if conn.is_broken() {
            return Err(RecycleError::Backend(SprocError::Connectivity(
                "connection was marked broken".into(),
            )));
        }
        if conn.in_transaction() {
            // A transaction leaked back into the pool; clear it before reuse.
            tracing::warn!(
                connection_id = %self.connection_id,
                "rolling back transaction left open on a returned connection"
            );
            conn.rollback().await.map_err(RecycleError::Backend)?;
        }
        conn.ping().await.map_err(RecycleError::Backend)
    }
}
