//! The operations the middleware exposes to its callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;

use crate::audit::{AuditEmitter, AuditEvent, AuditTarget};
use crate::backend::ConnectionFactory;
use crate::config::MiddlewareConfig;
use crate::context::CallOptions;
use crate::error::SprocError;
use crate::executor::StoredProcedureExecutor;
use crate::params::{BoundParameter, ParameterMarshaller, ProcedureContract};
use crate::provider::{ConnectionProvider, SecretResolver};
use crate::results::{ExecutionResult, NonQueryResult};
use crate::retry::{BreakerRegistry, CircuitBreaker, RetryDecision, RetryPolicy};
use crate::transaction::UnitOfWork;
use crate::types::{FromRowValue, RowValues};

/// Components shared by the gateway and the units of work it hands out.
pub(crate) struct GatewayCore {
    pub(crate) provider: Arc<ConnectionProvider>,
    pub(crate) executor: StoredProcedureExecutor,
    pub(crate) marshaller: ParameterMarshaller,
    pub(crate) retry: RetryPolicy,
    pub(crate) breakers: BreakerRegistry,
    pub(crate) audit: Arc<AuditEmitter>,
}

impl GatewayCore {
    pub(crate) fn record_audit(
        &self,
        options: &CallOptions,
        procedure: &str,
        connection_id: &str,
        elapsed: Duration,
        attempts: u32,
        error: Option<&SprocError>,
    ) {
        let target = options
            .audit_target()
            .cloned()
            .unwrap_or_else(|| AuditTarget::execute(procedure));
        let event = AuditEvent::for_target(options.correlation_id(), target)
            .actor(options.actor_id())
            .connection_id(connection_id)
            .duration(elapsed)
            .attempts(attempts)
            .outcome(error)
            .host(self.audit.host().clone())
            .build();
        // A refused event is logged and counted by the emitter; the business outcome stands.
        let _ = self.audit.record(event);
    }
}

/// Entry point: executes stored procedures by logical connection id with marshalling,
/// retry, circuit breaking and auditing.
///
/// Every operation runs: circuit admission, marshalling (once), the retry loop around
/// checkout and execution, then exactly one audit event. Cloning is cheap.
#[derive(Clone)]
pub struct ProcedureGateway {
    core: Arc<GatewayCore>,
}

impl ProcedureGateway {
    /// # Errors
    /// Returns `SprocError::Configuration` if `config` is invalid.
    pub fn new(
        config: &MiddlewareConfig,
        resolver: Arc<dyn SecretResolver>,
        factory: Arc<dyn ConnectionFactory>,
        audit: Arc<AuditEmitter>,
    ) -> Result<Self, SprocError> {
        let provider = Arc::new(ConnectionProvider::new(config, resolver, factory));
        Self::with_provider(config, provider, audit)
    }

    /// Build on an existing provider, e.g. one shared with a `ProcedureAuditSink`.
    ///
    /// # Errors
    /// Returns `SprocError::Configuration` if `config` is invalid.
    pub fn with_provider(
        config: &MiddlewareConfig,
        provider: Arc<ConnectionProvider>,
        audit: Arc<AuditEmitter>,
    ) -> Result<Self, SprocError> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(GatewayCore {
                provider,
                executor: StoredProcedureExecutor::new(config.execution.default_timeout()),
                marshaller: ParameterMarshaller::new(config.marshalling.strict),
                retry: RetryPolicy::from_config(&config.retry),
                breakers: BreakerRegistry::new(config.circuit_breaker.clone()),
                audit,
            }),
        })
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<ConnectionProvider> {
        &self.core.provider
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditEmitter> {
        &self.core.audit
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.core.retry
    }

    /// The breaker for `connection_id`, when circuit breaking is configured.
    #[must_use]
    pub fn breaker(&self, connection_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.core.breakers.get(connection_id)
    }

    /// Execute a procedure, returning database failures as a failed `ExecutionResult`.
    ///
    /// # Errors
    /// Non-database failures: `Validation`, `Configuration`, `Connectivity`,
    /// `SecretUnavailable`, `CircuitOpen`, `Cancelled`.
    pub async fn execute(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        let (result, elapsed) = self.run(connection_id, contract, values, options).await;
        match result {
            Err(SprocError::Database(err)) => Ok(ExecutionResult::failure(err.into(), elapsed)),
            other => other,
        }
    }

    /// Execute a procedure; every failure, database errors included, is an `Err`.
    ///
    /// # Errors
    /// The classified failure after retries are exhausted.
    pub async fn execute_strict(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        self.run(connection_id, contract, values, options).await.0
    }

    /// First column of the first row of the first result set; `None` when there are no
    /// rows or the value is NULL.
    ///
    /// # Errors
    /// As [`execute_strict`](Self::execute_strict), or `SprocError::Validation` if the
    /// value does not convert to `T`.
    pub async fn execute_scalar<T: FromRowValue>(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<Option<T>, SprocError> {
        let result = self
            .execute_strict(connection_id, contract, values, options)
            .await?;
        match result.first_value() {
            Some(value) => T::from_row_value(value),
            None => Ok(None),
        }
    }

    /// Rows affected by a procedure that returns no rows.
    ///
    /// # Errors
    /// As [`execute_strict`](Self::execute_strict).
    pub async fn execute_non_query(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<u64, SprocError> {
        Ok(self
            .execute_non_query_with_outputs(connection_id, contract, values, options)
            .await?
            .rows_affected())
    }

    /// Rows affected plus the output parameters and return code.
    ///
    /// # Errors
    /// As [`execute_strict`](Self::execute_strict).
    pub async fn execute_non_query_with_outputs(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> Result<NonQueryResult, SprocError> {
        Ok(self
            .execute_strict(connection_id, contract, values, options)
            .await?
            .into())
    }

    /// A fresh, idle unit of work for `connection_id`.
    ///
    /// # Errors
    /// Returns `SprocError::Configuration` if the connection id is unknown.
    pub fn unit_of_work(&self, connection_id: &str) -> Result<UnitOfWork, SprocError> {
        if !self.core.provider.knows(connection_id) {
            return Err(SprocError::Configuration(format!(
                "unknown connection id '{connection_id}'"
            )));
        }
        Ok(UnitOfWork::new(self.core.clone(), connection_id))
    }

    /// Run `body` inside a transaction, committing on `Ok` and rolling back on `Err`.
    ///
    /// On a retryable failure the whole transaction is restarted from `begin`, so `body`
    /// may run several times and must not keep side effects outside the database.
    ///
    /// ```rust,ignore
    /// let id = gateway
    ///     .run_in_transaction("main", &options, |uow| {
    ///         let contract = contract.clone();
    ///         let options = options.clone();
    ///         Box::pin(async move {
    ///             let res = uow.execute_non_query(&contract, &values, &options).await?;
    ///             res.output::<i64>("NewId")
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// # Errors
    /// The error returned by `body` or by `begin`/`commit`, after retries.
    pub async fn run_in_transaction<T, F>(
        &self,
        connection_id: &str,
        options: &CallOptions,
        mut body: F,
    ) -> Result<T, SprocError>
    where
        T: Send,
        F: for<'u> FnMut(&'u mut UnitOfWork) -> BoxFuture<'u, Result<T, SprocError>> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.transaction_attempt(connection_id, &mut body).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let RetryDecision::RetryAfter(delay) = self.core.retry.decide(&err, attempt) else {
                return Err(err);
            };
            tracing::warn!(
                connection_id,
                correlation_id = options.correlation_id(),
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                kind = ?err.kind(),
                "transaction failed transiently, restarting from begin"
            );
            tokio::select! {
                () = options.cancellation().cancelled() => return Err(SprocError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn transaction_attempt<T, F>(
        &self,
        connection_id: &str,
        body: &mut F,
    ) -> Result<T, SprocError>
    where
        F: for<'u> FnMut(&'u mut UnitOfWork) -> BoxFuture<'u, Result<T, SprocError>>,
    {
        let mut uow = self.unit_of_work(connection_id)?;
        uow.begin().await?;
        match body(&mut uow).await {
            Ok(value) => {
                uow.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if uow.has_active_transaction()
                    && let Err(rollback_err) = uow.rollback().await
                {
                    tracing::warn!(
                        connection_id,
                        error = %rollback_err.detailed_message(),
                        "rollback after failed transaction body failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
        options: &CallOptions,
    ) -> (Result<ExecutionResult, SprocError>, Duration) {
        let start = Instant::now();
        let (result, attempts) = match self.core.marshaller.bind(contract, values) {
            Ok(bound) => {
                let outcome = self
                    .core
                    .retry
                    .run(options.cancellation(), contract.name(), |_| {
                        self.attempt(connection_id, contract, &bound, options)
                    })
                    .await;
                (outcome.result, outcome.attempts)
            }
            Err(err) => (Err(err), 0),
        };
        let elapsed = start.elapsed();
        self.core.record_audit(
            options,
            contract.name(),
            connection_id,
            elapsed,
            attempts,
            result.as_ref().err(),
        );
        (result, elapsed)
    }

    /// One checkout-and-execute attempt. Database failures are returned as `Err` so the
    /// retry policy can judge them.
    async fn attempt(
        &self,
        connection_id: &str,
        contract: &ProcedureContract,
        bound: &[BoundParameter],
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        let breaker = self.core.breakers.get(connection_id);
        let admission = breaker.as_deref().map(CircuitBreaker::admit).transpose()?;

        let outcome = async {
            let mut conn = tokio::select! {
                biased;
                () = options.cancellation().cancelled() => return Err(SprocError::Cancelled),
                conn = self.core.provider.acquire(connection_id) => conn?,
            };
            let result = self
                .core
                .executor
                .execute(&mut conn, contract, bound, options)
                .await;
            if conn.is_broken() {
                conn.discard();
            }
            result?.into_result()
        }
        .await;

        if let Some(admission) = admission {
            admission.record(&outcome);
        }
        outcome
    }
}

impl std::fmt::Debug for ProcedureGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureGateway")
            .field("retry", &self.core.retry)
            .field("strict", &self.core.marshaller.is_strict())
            .finish()
    }
}
