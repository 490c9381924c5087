mod connection;
mod manager;

pub use connection::PooledConnection;
pub use manager::{ConnectionManager, ConnectionPool};
