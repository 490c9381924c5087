use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::RowValues;

/// Declared SQL type of a procedure parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Bit,
    Decimal,
    Money,
    Float,
    Real,
    Char,
    VarChar,
    NChar,
    NVarChar,
    Text,
    Date,
    Time,
    DateTime,
    DateTime2,
    UniqueIdentifier,
    VarBinary,
}

impl SqlType {
    /// Render the declaration used for a local variable of this type.
    ///
    /// `max_length` of `None` on a variable-length type means `MAX`.
    #[must_use]
    pub fn declaration(
        self,
        max_length: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
    ) -> String {
        let sized = |name: &str| match max_length {
            Some(len) => format!("{name}({len})"),
            None => format!("{name}(MAX)"),
        };
        match self {
            SqlType::TinyInt => "TINYINT".into(),
            SqlType::SmallInt => "SMALLINT".into(),
            SqlType::Int => "INT".into(),
            SqlType::BigInt => "BIGINT".into(),
            SqlType::Bit => "BIT".into(),
            SqlType::Decimal => format!(
                "DECIMAL({},{})",
                precision.unwrap_or(18),
                scale.unwrap_or(0)
            ),
            SqlType::Money => "MONEY".into(),
            SqlType::Float => "FLOAT".into(),
            SqlType::Real => "REAL".into(),
            SqlType::Char => format!("CHAR({})", max_length.unwrap_or(1)),
            SqlType::NChar => format!("NCHAR({})", max_length.unwrap_or(1)),
            SqlType::VarChar => sized("VARCHAR"),
            SqlType::NVarChar => sized("NVARCHAR"),
            SqlType::Text => "NVARCHAR(MAX)".into(),
            SqlType::Date => "DATE".into(),
            SqlType::Time => "TIME".into(),
            SqlType::DateTime => "DATETIME".into(),
            SqlType::DateTime2 => "DATETIME2".into(),
            SqlType::UniqueIdentifier => "UNIQUEIDENTIFIER".into(),
            SqlType::VarBinary => sized("VARBINARY"),
        }
    }

    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            SqlType::Char | SqlType::VarChar | SqlType::NChar | SqlType::NVarChar | SqlType::Text
        )
    }

    /// Whether a runtime value can be bound to a parameter of this type.
    #[must_use]
    pub fn accepts(self, value: &RowValues) -> bool {
        match value {
            RowValues::Null => true,
            RowValues::Int(_) => matches!(
                self,
                SqlType::TinyInt
                    | SqlType::SmallInt
                    | SqlType::Int
                    | SqlType::BigInt
                    | SqlType::Bit
                    | SqlType::Decimal
                    | SqlType::Money
                    | SqlType::Float
                    | SqlType::Real
            ),
            RowValues::Float(_) => matches!(
                self,
                SqlType::Decimal | SqlType::Money | SqlType::Float | SqlType::Real
            ),
            RowValues::Bool(_) => matches!(self, SqlType::Bit),
            RowValues::Text(_) => {
                self.is_textual()
                    || matches!(
                        self,
                        SqlType::UniqueIdentifier
                            | SqlType::Date
                            | SqlType::Time
                            | SqlType::DateTime
                            | SqlType::DateTime2
                            | SqlType::Decimal
                    )
            }
            RowValues::Timestamp(_) => {
                matches!(self, SqlType::Date | SqlType::DateTime | SqlType::DateTime2)
            }
            RowValues::JSON(_) => self.is_textual(),
            RowValues::Blob(_) => matches!(self, SqlType::VarBinary),
        }
    }

    /// Inclusive integer range for the fixed-width integer types.
    #[must_use]
    pub fn int_range(self) -> Option<(i64, i64)> {
        match self {
            SqlType::TinyInt => Some((0, 255)),
            SqlType::SmallInt => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            SqlType::Int => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            SqlType::Bit => Some((0, 1)),
            _ => None,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.declaration(None, None, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations() {
        assert_eq!(SqlType::NVarChar.declaration(Some(100), None, None), "NVARCHAR(100)");
        assert_eq!(SqlType::VarBinary.declaration(None, None, None), "VARBINARY(MAX)");
        assert_eq!(
            SqlType::Decimal.declaration(None, Some(18), Some(2)),
            "DECIMAL(18,2)"
        );
        assert_eq!(SqlType::Int.declaration(Some(4), None, None), "INT");
    }

    #[test]
    fn compatibility() {
        assert!(SqlType::Int.accepts(&RowValues::Int(1)));
        assert!(!SqlType::Int.accepts(&RowValues::Text("1".into())));
        assert!(SqlType::NVarChar.accepts(&RowValues::Text("x".into())));
        assert!(SqlType::VarBinary.accepts(&RowValues::Null));
        assert!(!SqlType::Bit.accepts(&RowValues::Float(1.0)));
    }
}
