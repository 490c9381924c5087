use std::sync::Arc;

use deadpool::managed::Object;

use super::manager::ConnectionManager;
use crate::backend::DbConnection;

/// A connection checked out of a pool.
///
/// Dropping it returns the connection to its pool; a connection marked broken is
/// discarded on its next recycle instead of being handed out again.
pub struct PooledConnection {
    conn: Object<ConnectionManager>,
    connection_id: Arc<str>,
}

impl PooledConnection {
    pub(crate) fn new(conn: Object<ConnectionManager>, connection_id: Arc<str>) -> Self {
        Self {
            conn,
            connection_id,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn db(&mut self) -> &mut dyn DbConnection {
        &mut **self.conn
    }

    /// Whether a transaction is open on this connection.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.conn.is_broken()
    }

    /// Detach the connection from its pool and close it.
    pub(crate) fn discard(self) {
        drop(Object::take(self.conn));
    }
}

// Manual Debug because the boxed connection does not expose `Debug`
impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.connection_id)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}
