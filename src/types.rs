use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

use crate::error::SprocError;

/// Values that can be stored in a result row, bound as a procedure parameter, or read back
/// from an output parameter.
///
/// `Null` is an explicit SQL NULL; a column or output that does not exist at all is
/// represented by `Option::None` at the lookup site, never by `Null`.
/// ```rust
/// use sproc_middleware::prelude::*;
///
/// let values = vec![
///     RowValues::Int(1),
///     RowValues::Text("alice".into()),
///     RowValues::Bool(true),
/// ];
/// # let _ = values;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// `tinyint`, `smallint`, `int`, `bigint`
    Int(i64),
    /// `real`, `float`, `decimal`, `numeric`, `money`
    Float(f64),
    /// `char`, `varchar`, `nchar`, `nvarchar`, `uniqueidentifier`, `xml`
    Text(String),
    /// `bit`
    Bool(bool),
    /// `date`, `datetime`, `datetime2`, `smalldatetime`
    Timestamp(NaiveDateTime),
    Null,
    /// Sent as `nvarchar(max)` text.
    JSON(JsonValue),
    /// `binary`, `varbinary`
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    /// `bit` columns, or the integers 0 and 1.
    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        match self {
            RowValues::Bool(value) => Some(value),
            RowValues::Int(0) => Some(&false),
            RowValues::Int(1) => Some(&true),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            RowValues::Timestamp(value) => Some(*value),
            // Fractional seconds are optional with %.f.
            RowValues::Text(s) => ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            RowValues::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            RowValues::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Short type name used in validation messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            RowValues::Int(_) => "int",
            RowValues::Float(_) => "float",
            RowValues::Text(_) => "text",
            RowValues::Bool(_) => "bool",
            RowValues::Timestamp(_) => "timestamp",
            RowValues::Null => "null",
            RowValues::JSON(_) => "json",
            RowValues::Blob(_) => "blob",
        }
    }

    /// JSON rendering for audit snapshots.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            RowValues::Int(i) => JsonValue::from(*i),
            RowValues::Float(f) => JsonValue::from(*f),
            RowValues::Text(s) => JsonValue::from(s.as_str()),
            RowValues::Bool(b) => JsonValue::from(*b),
            RowValues::Timestamp(dt) => JsonValue::from(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            RowValues::Null => JsonValue::Null,
            RowValues::JSON(v) => v.clone(),
            RowValues::Blob(bytes) => JsonValue::from(format!("<{} bytes>", bytes.len())),
        }
    }
}

impl From<i64> for RowValues {
    fn from(value: i64) -> Self {
        RowValues::Int(value)
    }
}

impl From<i32> for RowValues {
    fn from(value: i32) -> Self {
        RowValues::Int(i64::from(value))
    }
}

impl From<f64> for RowValues {
    fn from(value: f64) -> Self {
        RowValues::Float(value)
    }
}

impl From<bool> for RowValues {
    fn from(value: bool) -> Self {
        RowValues::Bool(value)
    }
}

impl From<&str> for RowValues {
    fn from(value: &str) -> Self {
        RowValues::Text(value.to_string())
    }
}

impl From<String> for RowValues {
    fn from(value: String) -> Self {
        RowValues::Text(value)
    }
}

impl From<NaiveDateTime> for RowValues {
    fn from(value: NaiveDateTime) -> Self {
        RowValues::Timestamp(value)
    }
}

impl From<Vec<u8>> for RowValues {
    fn from(value: Vec<u8>) -> Self {
        RowValues::Blob(value)
    }
}

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// Conversion from a dynamically-typed value into a Rust scalar.
///
/// `Ok(None)` means SQL NULL; a type mismatch is an error.
pub trait FromRowValue: Sized {
    /// # Errors
    /// Returns `SprocError::Validation` if the value has an incompatible type.
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError>;
}

fn mismatch(expected: &str, value: &RowValues) -> SprocError {
    SprocError::Validation(format!(
        "expected {expected} value, found {}",
        value.type_name()
    ))
}

impl FromRowValue for i64 {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            RowValues::Int(i) => Ok(Some(*i)),
            other => Err(mismatch("integer", other)),
        }
    }
}

impl FromRowValue for i32 {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match i64::from_row_value(value)? {
            None => Ok(None),
            Some(i) => i32::try_from(i)
                .map(Some)
                .map_err(|e| SprocError::Validation(format!("integer out of range: {e}"))),
        }
    }
}

impl FromRowValue for f64 {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            other => other.as_float().map(Some).ok_or_else(|| mismatch("float", other)),
        }
    }
}

impl FromRowValue for bool {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            other => other.as_bool().copied().map(Some).ok_or_else(|| mismatch("bool", other)),
        }
    }
}

impl FromRowValue for String {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            RowValues::Text(s) => Ok(Some(s.clone())),
            other => Err(mismatch("text", other)),
        }
    }
}

impl FromRowValue for NaiveDateTime {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            other => other
                .as_timestamp()
                .map(Some)
                .ok_or_else(|| mismatch("timestamp", other)),
        }
    }
}

impl FromRowValue for Vec<u8> {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            RowValues::Blob(b) => Ok(Some(b.clone())),
            other => Err(mismatch("binary", other)),
        }
    }
}

impl FromRowValue for JsonValue {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            RowValues::JSON(v) => Ok(Some(v.clone())),
            RowValues::Text(s) => serde_json::from_str(s)
                .map(Some)
                .map_err(|e| SprocError::Validation(format!("invalid JSON text: {e}"))),
            other => Err(mismatch("json", other)),
        }
    }
}

impl FromRowValue for RowValues {
    fn from_row_value(value: &RowValues) -> Result<Option<Self>, SprocError> {
        match value {
            RowValues::Null => Ok(None),
            other => Ok(Some(other.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions() {
        assert_eq!(i64::from_row_value(&RowValues::Int(7)).unwrap(), Some(7));
        assert_eq!(String::from_row_value(&RowValues::Null).unwrap(), None);
        assert_eq!(
            bool::from_row_value(&RowValues::Int(1)).unwrap(),
            Some(true)
        );
        assert!(i64::from_row_value(&RowValues::Text("7".into())).is_err());
        assert!(i32::from_row_value(&RowValues::Int(i64::MAX)).is_err());
    }

    #[test]
    fn option_into_null() {
        let none: Option<i64> = None;
        assert_eq!(RowValues::from(none), RowValues::Null);
        assert_eq!(RowValues::from(Some("x")), RowValues::Text("x".into()));
    }
}
