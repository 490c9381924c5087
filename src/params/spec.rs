use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{SqlType, normalize_parameter_name, validate_procedure_name};
use crate::error::SprocError;
use crate::types::RowValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterDirection {
    Input,
    Output,
    InputOutput,
}

impl ParameterDirection {
    /// Whether the caller supplies a value for this parameter.
    #[must_use]
    pub fn takes_input(self) -> bool {
        matches!(self, ParameterDirection::Input | ParameterDirection::InputOutput)
    }

    /// Whether the procedure hands a value back through this parameter.
    #[must_use]
    pub fn returns_output(self) -> bool {
        matches!(self, ParameterDirection::Output | ParameterDirection::InputOutput)
    }
}

/// Declared parameter of a stored procedure.
///
/// ```rust
/// use sproc_middleware::prelude::*;
///
/// let spec = ParameterSpec::input("Name", SqlType::NVarChar).max_length(100);
/// assert_eq!(spec.name(), "Name");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    name: String,
    direction: ParameterDirection,
    sql_type: SqlType,
    max_length: Option<u32>,
    precision: Option<u8>,
    scale: Option<u8>,
    nullable: bool,
    default: Option<RowValues>,
}

impl ParameterSpec {
    /// Declare a parameter. Names are stored without a leading `@`; invalid names are
    /// rejected when the parameter is added to a [`ProcedureContract`].
    #[must_use]
    pub fn new(name: &str, direction: ParameterDirection, sql_type: SqlType) -> Self {
        Self {
            name: name.trim().trim_start_matches('@').to_string(),
            direction,
            sql_type,
            max_length: None,
            precision: None,
            scale: None,
            // Output parameters start out NULL on the server, so they are nullable.
            nullable: direction == ParameterDirection::Output,
            default: None,
        }
    }

    #[must_use]
    pub fn input(name: &str, sql_type: SqlType) -> Self {
        Self::new(name, ParameterDirection::Input, sql_type)
    }

    #[must_use]
    pub fn output(name: &str, sql_type: SqlType) -> Self {
        Self::new(name, ParameterDirection::Output, sql_type)
    }

    #[must_use]
    pub fn input_output(name: &str, sql_type: SqlType) -> Self {
        Self::new(name, ParameterDirection::InputOutput, sql_type)
    }

    #[must_use]
    pub fn max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub fn precision_scale(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Value used when the caller does not supply one.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<RowValues>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn direction(&self) -> ParameterDirection {
        self.direction
    }

    #[must_use]
    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    #[must_use]
    pub fn get_max_length(&self) -> Option<u32> {
        self.max_length
    }

    #[must_use]
    pub fn precision(&self) -> Option<u8> {
        self.precision
    }

    #[must_use]
    pub fn scale(&self) -> Option<u8> {
        self.scale
    }

    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    #[must_use]
    pub fn get_default(&self) -> Option<&RowValues> {
        self.default.as_ref()
    }

    /// Type declaration for a local variable holding this parameter.
    #[must_use]
    pub fn declaration(&self) -> String {
        self.sql_type
            .declaration(self.max_length, self.precision, self.scale)
    }
}

/// The call contract of one stored procedure: its name and declared parameters.
///
/// Validated once on construction and immutable afterwards; clone the `Arc` returned by
/// [`ProcedureContract::shared`] to reuse it across calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureContract {
    name: String,
    parameters: Vec<ParameterSpec>,
}

impl ProcedureContract {
    /// Build a contract.
    ///
    /// # Errors
    /// Returns `SprocError::Validation` for an invalid procedure or parameter name, or a
    /// parameter declared twice.
    pub fn new(
        name: impl Into<String>,
        parameters: Vec<ParameterSpec>,
    ) -> Result<Self, SprocError> {
        let name = name.into();
        validate_procedure_name(&name)?;
        let mut seen = HashSet::with_capacity(parameters.len());
        for spec in &parameters {
            normalize_parameter_name(&spec.name)?;
            if !seen.insert(spec.name.to_ascii_lowercase()) {
                return Err(SprocError::Validation(format!(
                    "parameter '{}' declared twice for {name}",
                    spec.name
                )));
            }
        }
        Ok(Self { name, parameters })
    }

    /// Same as [`ProcedureContract::new`], wrapped for sharing.
    ///
    /// # Errors
    /// See [`ProcedureContract::new`].
    pub fn shared(
        name: impl Into<String>,
        parameters: Vec<ParameterSpec>,
    ) -> Result<Arc<Self>, SprocError> {
        Self::new(name, parameters).map(Arc::new)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    /// Number of Output/InputOutput parameters.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.parameters
            .iter()
            .filter(|p| p.direction.returns_output())
            .count()
    }
}
