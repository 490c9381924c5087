use std::collections::HashMap;

use super::{ParameterDirection, ParameterSpec, ProcedureContract};
use crate::error::SprocError;
use crate::types::RowValues;

/// A declared parameter paired with the value sent for this call.
///
/// `value` is `None` for Output parameters: they are placeholders the procedure fills in.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    spec: ParameterSpec,
    value: Option<RowValues>,
}

impl BoundParameter {
    #[must_use]
    pub fn spec(&self) -> &ParameterSpec {
        &self.spec
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    #[must_use]
    pub fn direction(&self) -> ParameterDirection {
        self.spec.direction()
    }

    /// Input value, or `None` for an Output placeholder.
    #[must_use]
    pub fn value(&self) -> Option<&RowValues> {
        self.value.as_ref()
    }
}

/// Binds caller-supplied values to a procedure contract.
///
/// In the default lenient mode, keys that match no declared parameter are ignored so that
/// callers can be upgraded ahead of procedures. Strict mode rejects them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterMarshaller {
    strict: bool,
}

impl ParameterMarshaller {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    #[must_use]
    pub fn strict() -> Self {
        Self { strict: true }
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Produce the bound parameters for one call, in contract order.
    ///
    /// # Errors
    /// Returns `SprocError::Validation` when a required input is missing or NULL, a value
    /// does not fit its declared type or length, two keys name the same parameter, or (in
    /// strict mode) a key is unknown.
    pub fn bind(
        &self,
        contract: &ProcedureContract,
        values: &HashMap<String, RowValues>,
    ) -> Result<Vec<BoundParameter>, SprocError> {
        let mut normalized: HashMap<String, (&str, &RowValues)> =
            HashMap::with_capacity(values.len());
        for (key, value) in values {
            let name = key.trim().trim_start_matches('@').to_ascii_lowercase();
            if let Some((other, _)) = normalized.insert(name, (key.as_str(), value)) {
                let (first, second) = if other < key.as_str() {
                    (other, key.as_str())
                } else {
                    (key.as_str(), other)
                };
                return Err(SprocError::Validation(format!(
                    "parameter keys '{first}' and '{second}' name the same parameter of {}",
                    contract.name()
                )));
            }
        }

        let mut bound = Vec::with_capacity(contract.parameters().len());
        let mut missing = Vec::new();
        let mut used = 0usize;

        for spec in contract.parameters() {
            let supplied = normalized.get(&spec.name().to_ascii_lowercase());
            if supplied.is_some() {
                used += 1;
            }

            if !spec.direction().takes_input() {
                // Output values are never read from the caller.
                bound.push(BoundParameter {
                    spec: spec.clone(),
                    value: None,
                });
                continue;
            }

            let value = match supplied {
                Some((_, value)) => (*value).clone(),
                None => match spec.get_default() {
                    Some(default) => default.clone(),
                    None => RowValues::Null,
                },
            };

            if value.is_null() && !spec.is_nullable() {
                missing.push(spec.name().to_string());
                continue;
            }
            check_value(spec, &value)?;

            bound.push(BoundParameter {
                spec: spec.clone(),
                value: Some(value),
            });
        }

        if !missing.is_empty() {
            return Err(SprocError::Validation(format!(
                "missing required parameter(s) for {}: {}",
                contract.name(),
                missing.join(", ")
            )));
        }

        if used < normalized.len() {
            let mut unknown: Vec<&str> = normalized
                .iter()
                .filter(|(key, _)| {
                    !contract
                        .parameters()
                        .iter()
                        .any(|p| p.name().eq_ignore_ascii_case(key))
                })
                .map(|(_, (original, _))| *original)
                .collect();
            unknown.sort_unstable();
            if self.strict {
                return Err(SprocError::Validation(format!(
                    "unknown parameter(s) for {}: {}",
                    contract.name(),
                    unknown.join(", ")
                )));
            }
            tracing::debug!(
                procedure = contract.name(),
                ignored = ?unknown,
                "ignoring parameters not declared by the procedure"
            );
        }

        Ok(bound)
    }
}

fn check_value(spec: &ParameterSpec, value: &RowValues) -> Result<(), SprocError> {
    if !spec.sql_type().accepts(value) {
        return Err(SprocError::Validation(format!(
            "parameter '{}' expects {}, got {}",
            spec.name(),
            spec.declaration(),
            value.type_name()
        )));
    }

    if let (Some((min, max)), RowValues::Int(i)) = (spec.sql_type().int_range(), value)
        && (*i < min || *i > max)
    {
        return Err(SprocError::Validation(format!(
            "parameter '{}' value {i} is out of range for {}",
            spec.name(),
            spec.declaration()
        )));
    }

    if let Some(max_len) = spec.get_max_length() {
        let len = match value {
            RowValues::Text(s) => s.chars().count(),
            RowValues::JSON(v) => v.to_string().chars().count(),
            RowValues::Blob(b) => b.len(),
            _ => 0,
        };
        if len > max_len as usize {
            return Err(SprocError::Validation(format!(
                "parameter '{}' exceeds maximum length {max_len} (got {len})",
                spec.name()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SqlType;

    fn contract() -> ProcedureContract {
        ProcedureContract::new(
            "sp_TestNonQuery",
            vec![
                ParameterSpec::input("Name", SqlType::NVarChar).max_length(5),
                ParameterSpec::input("Value", SqlType::Int),
                ParameterSpec::input("Note", SqlType::NVarChar).nullable(),
                ParameterSpec::input("Kind", SqlType::TinyInt).default_value(1),
                ParameterSpec::output("NewId", SqlType::Int),
            ],
        )
        .unwrap()
    }

    fn values(pairs: &[(&str, RowValues)]) -> HashMap<String, RowValues> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn binds_in_contract_order() {
        let bound = ParameterMarshaller::default()
            .bind(
                &contract(),
                &values(&[("@value", RowValues::Int(9)), ("name", "X".into())]),
            )
            .unwrap();
        let names: Vec<_> = bound.iter().map(BoundParameter::name).collect();
        assert_eq!(names, ["Name", "Value", "Note", "Kind", "NewId"]);
        assert_eq!(bound[2].value(), Some(&RowValues::Null));
        assert_eq!(bound[3].value(), Some(&RowValues::Int(1)));
        assert_eq!(bound[4].value(), None);
    }

    #[test]
    fn missing_required_names_field() {
        let err = ParameterMarshaller::default()
            .bind(&contract(), &values(&[("Name", RowValues::Null)]))
            .unwrap_err();
        let SprocError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert!(msg.contains("Name"));
        assert!(msg.contains("Value"));
    }

    #[test]
    fn unknown_keys_depend_on_mode() {
        let input = values(&[
            ("Name", "X".into()),
            ("Value", RowValues::Int(1)),
            ("Extra", RowValues::Int(2)),
        ]);
        assert!(ParameterMarshaller::default().bind(&contract(), &input).is_ok());
        let err = ParameterMarshaller::strict()
            .bind(&contract(), &input)
            .unwrap_err();
        assert!(err.to_string().contains("Extra"));
    }

    #[test]
    fn keys_differing_only_in_spelling_are_rejected() {
        let input = values(&[
            ("Name", "X".into()),
            ("Value", RowValues::Int(1)),
            ("@value", RowValues::Int(2)),
        ]);
        for marshaller in [ParameterMarshaller::default(), ParameterMarshaller::strict()] {
            let err = marshaller.bind(&contract(), &input).unwrap_err();
            let SprocError::Validation(msg) = err else {
                panic!("expected validation error");
            };
            assert!(msg.contains("'@value' and 'Value'"), "{msg}");
        }
    }

    #[test]
    fn rejects_type_and_length() {
        let too_long = values(&[("Name", "toolong".into()), ("Value", RowValues::Int(1))]);
        assert!(ParameterMarshaller::default().bind(&contract(), &too_long).is_err());

        let wrong_type = values(&[("Name", "X".into()), ("Value", "one".into())]);
        assert!(ParameterMarshaller::default().bind(&contract(), &wrong_type).is_err());

        let out_of_range = values(&[
            ("Name", "X".into()),
            ("Value", RowValues::Int(1)),
            ("Kind", RowValues::Int(300)),
        ]);
        assert!(ParameterMarshaller::default().bind(&contract(), &out_of_range).is_err());
    }

    #[test]
    fn output_values_are_never_read() {
        let bound = ParameterMarshaller::strict()
            .bind(
                &contract(),
                &values(&[
                    ("Name", "X".into()),
                    ("Value", RowValues::Int(1)),
                    ("NewId", RowValues::Int(77)),
                ]),
            )
            .unwrap();
        assert_eq!(bound[4].value(), None);
    }
}
