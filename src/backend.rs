//! Backend seam: what a database connection must provide to run procedures.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::SprocError;
use crate::params::BoundParameter;
use crate::results::ResultSet;
use crate::types::RowValues;

/// Everything a backend read back from one procedure call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcedureOutput {
    pub result_sets: Vec<ResultSet>,
    /// Values of the Output/InputOutput parameters the backend could read back.
    pub output_values: HashMap<String, RowValues>,
    pub return_code: Option<i32>,
    pub rows_affected: u64,
}

/// A live database connection.
///
/// Implementations convert every native error into a classified [`SprocError`] before
/// returning it. None of the methods retry.
#[async_trait]
pub trait DbConnection: Send {
    /// Invoke a stored procedure and read every result set, output value and the return
    /// code before returning.
    async fn call_procedure(
        &mut self,
        procedure: &str,
        params: &[BoundParameter],
    ) -> Result<ProcedureOutput, SprocError>;

    async fn begin(&mut self) -> Result<(), SprocError>;

    async fn commit(&mut self) -> Result<(), SprocError>;

    async fn rollback(&mut self) -> Result<(), SprocError>;

    /// Cheap liveness probe used when a pooled connection is recycled.
    async fn ping(&mut self) -> Result<(), SprocError>;

    /// Whether a transaction is open on this connection.
    fn in_transaction(&self) -> bool;

    /// Flag the connection as unusable, e.g. after a call was abandoned mid-flight.
    fn mark_broken(&mut self);

    fn is_broken(&self) -> bool;
}

/// Opens connections from a resolved connection string.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// # Errors
    /// Returns `SprocError::Connectivity` when the network or login handshake fails and
    /// `SprocError::Configuration` when the connection string is malformed.
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn DbConnection>, SprocError>;
}
