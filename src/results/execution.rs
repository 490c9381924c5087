use std::collections::HashMap;
use std::time::Duration;

use super::ResultSet;
use crate::classify::ErrorCategory;
use crate::error::{ErrorKind, SprocError};
use crate::types::{FromRowValue, RowValues};

/// Outcome of one stored-procedure call.
///
/// Built once per call and immutable afterwards. A successful result carries every
/// result set, one entry per declared Output/InputOutput parameter, the return code and
/// the rows-affected count. A failed result carries only the elapsed time and the error.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    result_sets: Vec<ResultSet>,
    output_parameters: HashMap<String, RowValues>,
    return_code: Option<i32>,
    rows_affected: u64,
    elapsed: Duration,
    error: Option<SprocError>,
}

impl ExecutionResult {
    pub(crate) fn success(
        result_sets: Vec<ResultSet>,
        output_parameters: HashMap<String, RowValues>,
        return_code: Option<i32>,
        rows_affected: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            result_sets,
            output_parameters,
            return_code,
            rows_affected,
            elapsed,
            error: None,
        }
    }

    pub(crate) fn failure(error: SprocError, elapsed: Duration) -> Self {
        Self {
            result_sets: Vec::new(),
            output_parameters: HashMap::new(),
            return_code: None,
            rows_affected: 0,
            elapsed,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn result_sets(&self) -> &[ResultSet] {
        &self.result_sets
    }

    /// First result set, if the procedure returned any.
    #[must_use]
    pub fn first_set(&self) -> Option<&ResultSet> {
        self.result_sets.first()
    }

    /// First column of the first row of the first result set.
    #[must_use]
    pub fn first_value(&self) -> Option<&RowValues> {
        self.first_set().and_then(ResultSet::first_value)
    }

    #[must_use]
    pub fn output_parameters(&self) -> &HashMap<String, RowValues> {
        &self.output_parameters
    }

    /// Raw output value by parameter name (leading `@` optional).
    #[must_use]
    pub fn output_value(&self, name: &str) -> Option<&RowValues> {
        let name = name.trim_start_matches('@');
        self.output_parameters.get(name).or_else(|| {
            self.output_parameters
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    /// Typed output value. `Ok(None)` when the output is NULL.
    ///
    /// # Errors
    /// Returns `SprocError::Validation` if no such output exists or its type does not match.
    pub fn output<T: FromRowValue>(&self, name: &str) -> Result<Option<T>, SprocError> {
        let value = self
            .output_value(name)
            .ok_or_else(|| SprocError::Validation(format!("no output parameter named '{name}'")))?;
        T::from_row_value(value)
    }

    #[must_use]
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The classified error of a failed call.
    #[must_use]
    pub fn error(&self) -> Option<&SprocError> {
        self.error.as_ref()
    }

    /// Caller-safe error message of a failed call.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(SprocError::safe_message)
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(SprocError::kind)
    }

    #[must_use]
    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().and_then(SprocError::category)
    }

    /// Convert into exception-style control flow: failures become `Err`.
    ///
    /// # Errors
    /// Returns the classified error of a failed call.
    pub fn into_result(self) -> Result<ExecutionResult, SprocError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Outcome of a call that is not expected to return rows.
#[derive(Debug, Clone, PartialEq)]
pub struct NonQueryResult {
    rows_affected: u64,
    return_code: Option<i32>,
    output_parameters: HashMap<String, RowValues>,
}

impl NonQueryResult {
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    #[must_use]
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    #[must_use]
    pub fn output_parameters(&self) -> &HashMap<String, RowValues> {
        &self.output_parameters
    }

    /// Typed output value. `Ok(None)` when the output is NULL.
    ///
    /// # Errors
    /// Returns `SprocError::Validation` if no such output exists or its type does not match.
    pub fn output<T: FromRowValue>(&self, name: &str) -> Result<Option<T>, SprocError> {
        let name = name.trim_start_matches('@');
        let value = self
            .output_parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .ok_or_else(|| SprocError::Validation(format!("no output parameter named '{name}'")))?;
        T::from_row_value(value)
    }
}

impl From<ExecutionResult> for NonQueryResult {
    fn from(result: ExecutionResult) -> Self {
        Self {
            rows_affected: result.rows_affected,
            return_code: result.return_code,
            output_parameters: result.output_parameters,
        }
    }
}
