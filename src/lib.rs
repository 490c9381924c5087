//! Stored-procedure execution for SQL Server.
//!
//! Calls go through a [`ProcedureGateway`], addressed by logical connection id:
//!
//! 1. the [`ConnectionProvider`] resolves the connection's secret and checks out a pooled
//!    connection,
//! 2. the [`ParameterMarshaller`] binds caller values to the [`ProcedureContract`],
//! 3. the [`StoredProcedureExecutor`] runs the call under a timeout and a cancellation
//!    token and collects result sets, outputs and the return code,
//! 4. transient failures are retried by the [`RetryPolicy`], optionally behind a
//!    per-connection [`CircuitBreaker`],
//! 5. one [`AuditEvent`] is queued per operation on the [`AuditEmitter`].
//!
//! Multi-call transactions use a [`UnitOfWork`] from [`ProcedureGateway::unit_of_work`],
//! or [`ProcedureGateway::run_in_transaction`] to restart the whole transaction on
//! transient failures.

#[macro_use]
mod macros;

pub mod audit;
pub mod backend;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod params;
pub mod pool;
pub mod prelude;
pub mod provider;
pub mod repository;
pub mod results;
pub mod retry;
pub mod transaction;
pub mod types;

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use audit::{AuditEmitter, AuditEvent, AuditSink, AuditTarget, OperationKind};
pub use backend::{ConnectionFactory, DbConnection, ProcedureOutput};
pub use classify::{ErrorCategory, classify};
pub use config::{ConnectionDefinition, MiddlewareConfig};
pub use context::{CallOptions, HostContext};
pub use error::{DatabaseError, ErrorKind, FailureReport, SprocError};
pub use executor::{ExecTarget, StoredProcedureExecutor};
pub use gateway::ProcedureGateway;
pub use params::{
    BoundParameter, ParameterDirection, ParameterMarshaller, ParameterSpec, ProcedureContract,
    SqlType,
};
pub use pool::PooledConnection;
pub use provider::{ConnectionProvider, SecretResolver};
pub use repository::{EntityMapping, FnEntityMapping, Page, ProcedureRepository};
pub use results::{ExecutionResult, NonQueryResult, ResultRow, ResultSet};
pub use retry::{Admission, CircuitBreaker, CircuitState, RetryPolicy};
pub use transaction::{TransactionState, UnitOfWork};
pub use types::{FromRowValue, RowValues};

#[cfg(feature = "mssql")]
pub use mssql::MssqlConnectionFactory;
