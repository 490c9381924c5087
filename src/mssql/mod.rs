//! SQL Server backend over Tiberius.
//!
//! - `client`: ADO.NET connection strings, TCP connect, Azure gateway redirects
//! - `query`: the procedure call batch and result decoding
//! - `connection`: [`MssqlConnection`], the `DbConnection` implementation
//! - `error`: Tiberius errors to classified middleware errors

pub mod client;
mod connection;
mod error;
pub mod query;

pub use client::{MssqlClient, MssqlConnectionFactory, connect};
pub use connection::MssqlConnection;

