//! Procedure contracts and parameter marshalling.
//!
//! - `sql_type`: declared SQL types and value compatibility
//! - `spec`: parameter specs and procedure contracts
//! - `marshal`: binding caller values to a contract

mod marshal;
mod spec;
mod sql_type;

pub use marshal::{BoundParameter, ParameterMarshaller};
pub use spec::{ParameterDirection, ParameterSpec, ProcedureContract};
pub use sql_type::SqlType;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::SprocError;

lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid");
    static ref PROCEDURE_NAME: Regex = Regex::new(
        r"^(?:(?:\[[A-Za-z_][A-Za-z0-9_ ]*\]|[A-Za-z_][A-Za-z0-9_]*)\.){0,2}(?:\[[A-Za-z_][A-Za-z0-9_ ]*\]|[A-Za-z_][A-Za-z0-9_]*)$"
    )
    .expect("procedure name pattern is valid");
}

/// Strip a leading `@` and validate a parameter name.
///
/// # Errors
/// Returns `SprocError::Validation` when the name is not a plain identifier.
pub fn normalize_parameter_name(name: &str) -> Result<String, SprocError> {
    let trimmed = name.trim().trim_start_matches('@');
    if IDENTIFIER.is_match(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(SprocError::Validation(format!(
            "invalid parameter name '{name}'"
        )))
    }
}

/// Validate a (optionally schema- and database-qualified) procedure name.
///
/// # Errors
/// Returns `SprocError::Validation` when the name could not be safely embedded in a call.
pub fn validate_procedure_name(name: &str) -> Result<(), SprocError> {
    if PROCEDURE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(SprocError::Validation(format!(
            "invalid procedure name '{name}'"
        )))
    }
}
