//! Convenient imports for common functionality.
//!
//! ```rust
//! use sproc_middleware::prelude::*;
//! ```

pub use crate::audit::{AuditEmitter, AuditEvent, AuditSink, AuditTarget, OperationKind};
pub use crate::config::{ConnectionDefinition, MiddlewareConfig};
pub use crate::context::{CallOptions, HostContext};
pub use crate::error::{DatabaseError, ErrorKind, SprocError};
pub use crate::gateway::ProcedureGateway;
pub use crate::params;
pub use crate::params::{ParameterSpec, ProcedureContract, SqlType};
pub use crate::provider::{EnvSecretResolver, SecretResolver, StaticSecretResolver};
pub use crate::repository::{FnEntityMapping, Page, ProcedureRepository, RepositoryProcedures};
pub use crate::results::{ExecutionResult, NonQueryResult, ResultRow, ResultSet};
pub use crate::transaction::{TransactionState, UnitOfWork};
pub use crate::types::{FromRowValue, RowValues};

#[cfg(feature = "mssql")]
pub use crate::mssql::MssqlConnectionFactory;
