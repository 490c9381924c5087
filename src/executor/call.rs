use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::ExecTarget;
use crate::backend::{DbConnection, ProcedureOutput};
use crate::context::CallOptions;
use crate::error::{DatabaseError, SprocError};
use crate::params::{BoundParameter, ProcedureContract};
use crate::results::ExecutionResult;
use crate::types::RowValues;

/// Runs one procedure call. Never retries.
///
/// Database errors are classified and returned inside a failed [`ExecutionResult`];
/// [`execute_strict`](Self::execute_strict) turns them into `Err` instead. Both paths
/// share the same classification.
#[derive(Debug, Clone, Copy)]
pub struct StoredProcedureExecutor {
    default_timeout: Duration,
}

impl Default for StoredProcedureExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl StoredProcedureExecutor {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute `contract` with already-bound parameters.
    ///
    /// # Errors
    /// - `SprocError::Cancelled` if the options' token fires before the call completes,
    /// - `SprocError::InvalidState` if the target is a unit of work without an active
    ///   transaction,
    /// - `SprocError::Connectivity` if the connection fails mid-call.
    ///
    /// Database errors, timeouts included, come back as a failed `ExecutionResult`.
    pub async fn execute(
        &self,
        target: impl Into<ExecTarget<'_>>,
        contract: &ProcedureContract,
        params: &[BoundParameter],
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        match target.into() {
            ExecTarget::Connection(conn) => {
                self.call(conn.db(), contract.name(), params, options).await
            }
            ExecTarget::UnitOfWork(uow) => {
                uow.execute_bound(self, contract, params, options).await
            }
        }
    }

    /// Like [`execute`](Self::execute) but database failures are returned as `Err`.
    ///
    /// # Errors
    /// Everything [`execute`](Self::execute) returns, plus `SprocError::Database`.
    pub async fn execute_strict(
        &self,
        target: impl Into<ExecTarget<'_>>,
        contract: &ProcedureContract,
        params: &[BoundParameter],
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        self.execute(target, contract, params, options)
            .await?
            .into_result()
    }

    /// Issue the call on `conn` under the options' timeout and cancellation token.
    ///
    /// A timed-out or cancelled call leaves the wire protocol in an unknown state, so the
    /// connection is marked broken and never reused.
    pub(crate) async fn call(
        &self,
        conn: &mut dyn DbConnection,
        procedure: &str,
        params: &[BoundParameter],
        options: &CallOptions,
    ) -> Result<ExecutionResult, SprocError> {
        let cancel = options.cancellation();
        if cancel.is_cancelled() {
            return Err(SprocError::Cancelled);
        }

        let timeout = options.get_timeout().unwrap_or(self.default_timeout);
        let start = Instant::now();
        tracing::debug!(
            procedure,
            correlation_id = options.correlation_id(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "calling procedure"
        );

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = tokio::time::timeout(timeout, conn.call_procedure(procedure, params)) => Some(res),
        };
        let elapsed = start.elapsed();

        match outcome {
            None => {
                conn.mark_broken();
                tracing::debug!(
                    procedure,
                    correlation_id = options.correlation_id(),
                    "procedure call cancelled"
                );
                Err(SprocError::Cancelled)
            }
            Some(Err(_)) => {
                conn.mark_broken();
                let err = DatabaseError::timeout(format!(
                    "{procedure} did not complete within {} ms",
                    timeout.as_millis()
                ));
                Ok(ExecutionResult::failure(err.into(), elapsed))
            }
            Some(Ok(Err(SprocError::Database(err)))) => {
                tracing::debug!(
                    procedure,
                    correlation_id = options.correlation_id(),
                    code = err.code,
                    category = %err.category,
                    "procedure raised a database error"
                );
                Ok(ExecutionResult::failure(err.into(), elapsed))
            }
            Some(Ok(Err(err))) => {
                if matches!(err, SprocError::Connectivity(_)) {
                    conn.mark_broken();
                }
                Err(err)
            }
            Some(Ok(Ok(output))) => Ok(into_result(output, params, elapsed)),
        }
    }
}

/// Build the success result, with exactly one output entry per declared output.
fn into_result(
    output: ProcedureOutput,
    params: &[BoundParameter],
    elapsed: Duration,
) -> ExecutionResult {
    let ProcedureOutput {
        result_sets,
        mut output_values,
        return_code,
        rows_affected,
    } = output;

    let mut outputs = HashMap::new();
    for param in params.iter().filter(|p| p.direction().returns_output()) {
        let value = output_values.remove(param.name()).or_else(|| {
            let key = output_values
                .keys()
                .find(|k| k.trim_start_matches('@').eq_ignore_ascii_case(param.name()))
                .cloned()?;
            output_values.remove(&key)
        });
        outputs.insert(param.name().to_string(), value.unwrap_or(RowValues::Null));
    }

    ExecutionResult::success(result_sets, outputs, return_code, rows_affected, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterMarshaller, ParameterSpec, SqlType};

    #[test]
    fn outputs_match_declarations() {
        let contract = ProcedureContract::new(
            "sp_Out",
            vec![
                ParameterSpec::input("In", SqlType::Int),
                ParameterSpec::output("A", SqlType::Int),
                ParameterSpec::input_output("B", SqlType::NVarChar).nullable(),
            ],
        )
        .unwrap();
        let mut values = HashMap::new();
        values.insert("In".to_string(), RowValues::Int(1));
        let bound = ParameterMarshaller::default().bind(&contract, &values).unwrap();

        let mut output_values = HashMap::new();
        output_values.insert("@a".to_string(), RowValues::Int(5));
        output_values.insert("Stray".to_string(), RowValues::Int(9));
        let result = into_result(
            ProcedureOutput {
                output_values,
                ..ProcedureOutput::default()
            },
            &bound,
            Duration::ZERO,
        );

        assert_eq!(result.output_parameters().len(), contract.output_count());
        assert_eq!(result.output_value("A"), Some(&RowValues::Int(5)));
        assert_eq!(result.output_value("B"), Some(&RowValues::Null));
        assert!(result.output_value("Stray").is_none());
    }
}
