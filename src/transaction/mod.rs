//! Unit of work: one transaction spanning several procedure calls on one connection.
//!
//! ```text
//! Idle --begin--> Active --commit--> Committed
//!                        --rollback--> RolledBack
//! ```
//!
//! A unit of work may begin again after a full commit/rollback cycle. Calls are never
//! retried here; to retry a transaction, restart it from `begin` (see
//! [`ProcedureGateway::run_in_transaction`](crate::ProcedureGateway::run_in_transaction)).

mod handle;

pub use handle::{TransactionHandle, TransactionState};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;

use crate::context::CallOptions;
use crate::error::SprocError;
use crate::executor::StoredProcedureExecutor;
use crate::gateway::GatewayCore;
use crate::params::{BoundParameter, ProcedureContract};
use crate::pool::PooledConnection;
use crate::results::{ExecutionResult, NonQueryResult};
use crate::retry::CircuitBreaker;
use crate::types::{FromRowValue, RowValues};

/// Owns a transaction and its connection for as long as the transaction is active.
///
/// Calls are strictly sequential (`&mut self`). Dropping a unit of work with an active
/// transaction rolls it back in the background before the connection is released.
pub struct UnitOfWork {
    core: Arc<GatewayCore>,
    connection_id: String,
    handle: TransactionHandle,
}

impl UnitOfWork {
    pub(crate) fn new(core: Arc<GatewayCore>, connection_id: impl Into<String>) -> Self {
        Self {
            core,
            connection_id: connection_id.into(),
            handle: TransactionHandle::idle(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.handle.state()
    }

    #[must_use]
    pub fn has_active_transaction(&self) -> bool {
        self.handle.is_active()
    }

    #[must_use]
    pub fn transaction(&self) -> &TransactionHandle {
        &self.handle
    }

    /// Check out a connection and open a transaction on it.
    ///
    /// # Errors
    /// - `SprocError::InvalidState` if a transaction is already active; it is left
    ///   untouched,
    /// - `SprocError::CircuitOpen` if the circuit for this connection id is open,
    /// - any checkout or `BEGIN` failure.
    pub async fn begin(&mut self) -> Result<(), SprocError> {
        if self.handle.is_active() {
            return Err(SprocError::InvalidState(
                "a transaction is already active on this unit of work".into(),
            ));
        }

        let breaker = self.core.breakers.get(&self.connection_id);
        let admission = breaker.as_deref().map(CircuitBreaker::admit).transpose()?;
        let opened = self.open().await;
        if let Some(admission) = admission {
            admission.record(&opened);
        }

        self.handle = TransactionHandle::active(opened?);
        tracing::debug!(connection_id = %self.connection_id, "transaction started");
        Ok(())
    }

    async fn open(&self) -> Result<PooledConnection, SprocError> {
        let mut conn = self.core.provider.acquire(&self.connection_id).await?;
        if let Err(err) = conn.db().begin().await {
            if conn.is_broken() {
                conn.discard();
            }
            return Err(err);
        }
        Ok(conn)
    }

    /// Commit and release the connection.
    ///
    /// The unit of work is reusable afterwards whatever the outcome. If `COMMIT` fails the
    /// state becomes `RolledBack` and the connection is discarded.
    ///
    /// # Errors
    /// `SprocError::InvalidState` if no transaction is active, or the `COMMIT` failure.
    pub async fn commit(&mut self) -> Result<(), SprocError> {
        let mut conn = self.handle.close(TransactionState::Committed, "commit")?;
        let result = conn.db().commit().await;
        match &result {
            Ok(()) => {
                tracing::debug!(connection_id = %self.connection_id, "transaction committed");
            }
            Err(err) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    error = %err.detailed_message(),
                    "commit failed"
                );
                self.handle.set_state(TransactionState::RolledBack);
                conn.db().mark_broken();
                conn.discard();
            }
        }
        result
    }

    /// Roll back and release the connection.
    ///
    /// A connection left broken by a timed-out or cancelled call cannot carry a
    /// `ROLLBACK`; it is closed instead, which ends the transaction server-side.
    ///
    /// # Errors
    /// `SprocError::InvalidState` if no transaction is active, or the `ROLLBACK` failure.
    /// The state is `RolledBack` in every case.
    pub async fn rollback(&mut self) -> Result<(), SprocError> {
        let mut conn = self.handle.close(TransactionState::RolledBack, "roll back")?;
        if conn.is_broken() {
            tracing::debug!(
                connection_id = %self.connection_id,
                "closing broken connection to end its transaction"
            );
            conn.discard();
            return Ok(());
        }
        let result = conn.db().rollback().await;
        match &result {
            Ok(()) => {
                tracing::debug!(connection_id = %self.connection_id, "transaction rolled back");
            }
            Err(err) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    error = %err.detailed_message(),
                    "rollback failed, closing connection"
                );
                conn.db().mark_broken();
                conn.discard();
            }
        }
        result
    }

    /// Marshal `values` and call `contract` inside the active transaction.
    ///
    /// One audit event is recorded per call. Database errors come back as a failed
    /// result and leave the transaction active for the caller to roll back; a timed-out
    /// or cancelled call rolls the transaction back before returning.
    ///
    /// # Errors
    /// - `SprocError::InvalidState` if no transaction is active,
    /// - `SprocError::Validation` if the values do not fit the contract,
    /// - `SprocError::Cancelled` if the call was cancelled.
    pub async fn execute(
        &mut self,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        let start = Instant::now();
        let result = match self.core.marshaller.bind(contract, values) {
            Ok(bound) => {
                let executor = self.core.executor;
                self.execute_bound(&executor, contract, &bound, options)
                    .await
            }
            Err(err) => Err(err),
        };
        let error = match &result {
            Ok(res) => res.error(),
            Err(err) => Some(err),
        };
        self.core.record_audit(
            options,
            contract.name(),
            &self.connection_id,
            start.elapsed(),
            1,
            error,
        );
        result
    }

    /// Like [`execute`](Self::execute) but database failures are returned as `Err`.
    ///
    /// # Errors
    /// Everything [`execute`](Self::execute) returns, plus `SprocError::Database`.
    pub async fn execute_strict(
        &mut self,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        self.execute(contract, values, options).await?.into_result()
    }

    /// First column of the first row of the first result set.
    ///
    /// # Errors
    /// As [`execute_strict`](Self::execute_strict), or `SprocError::Validation` if the
    /// value does not convert to `T`.
    pub async fn execute_scalar<T: FromRowValue>(
        &mut self,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<Option<T>, SprocError> {
        let result = self.execute_strict(contract, values, options).await?;
        match result.first_value() {
            Some(value) => T::from_row_value(value),
            None => Ok(None),
        }
    }

    /// # Errors
    /// As [`execute_strict`](Self::execute_strict).
    pub async fn execute_non_query(
        &mut self,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<NonQueryResult, SprocError> {
        Ok(self.execute_strict(contract, values, options).await?.into())
    }

    /// Run already-bound parameters on the transaction's connection.
    pub(crate) async fn execute_bound(
        &mut self,
        executor: &StoredProcedureExecutor,
        contract: &ProcedureContract,
        params: &[BoundParameter],
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        let conn = self.handle.connection_mut().ok_or_else(|| {
            SprocError::InvalidState(format!(
                "cannot call {}: no active transaction",
                contract.name()
            ))
        })?;
        let result = executor
            .call(conn.db(), contract.name(), params, options)
            .await;
        let interrupted = conn.is_broken() || matches!(result, Err(SprocError::Cancelled));

        if interrupted {
            tracing::warn!(
                connection_id = %self.connection_id,
                correlation_id = options.correlation_id(),
                procedure = contract.name(),
                "call interrupted inside a transaction, rolling back"
            );
            if let Err(err) = self.rollback().await {
                tracing::error!(
                    connection_id = %self.connection_id,
                    error = %err.detailed_message(),
                    "rollback after interrupted call failed"
                );
            }
        }
        result
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let Some(mut conn) = self.handle.abandon() else {
            return;
        };
        tracing::warn!(
            connection_id = %self.connection_id,
            "unit of work dropped with an active transaction, rolling back"
        );
        if conn.is_broken() {
            conn.discard();
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let connection_id = self.connection_id.clone();
                runtime.spawn(async move {
                    if let Err(err) = conn.db().rollback().await {
                        tracing::error!(
                            %connection_id,
                            error = %err.detailed_message(),
                            "rollback of dropped unit of work failed"
                        );
                        conn.db().mark_broken();
                        conn.discard();
                    }
                });
            }
            Err(_) => {
                // Without a runtime the rollback cannot run; the pool must not reuse it.
                conn.db().mark_broken();
            }
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("connection_id", &self.connection_id)
            .field("state", &self.handle.state())
            .finish()
    }
}
