//! The T-SQL batch behind one procedure call and the decoding of what comes back.
//!
//! Each parameter is copied into a local variable of its declared type so output values
//! can be selected after the call. The batch ends with a trailer result set carrying the
//! return code, the affected-row count and the outputs:
//!
//! ```text
//! DECLARE @__rc INT, @__rows BIGINT;
//! DECLARE @__p0 INT = @P1;
//! DECLARE @__p1 NVARCHAR(50);
//! EXEC @__rc = dbo.usp_Create @Id = @__p0, @Name = @__p1 OUTPUT;
//! SET @__rows = ROWCOUNT_BIG();
//! SELECT @__rc AS [__return_code], @__rows AS [__rows_affected], @__p1 AS [Name];
//! ```
//!
//! The batch leaves session options alone, so a pooled connection goes back unchanged.
//! The row stream does not surface per-statement done counts, so the affected-row count
//! is the one reported by the last statement the procedure ran.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use futures_util::TryStreamExt;
use tiberius::{ColumnData, FromSql, Query, QueryItem};

use super::MssqlClient;
use super::error::map_error;
use crate::backend::ProcedureOutput;
use crate::error::SprocError;
use crate::params::BoundParameter;
use crate::results::ResultSet;
use crate::types::RowValues;

pub(crate) const RETURN_CODE_COLUMN: &str = "__return_code";
const ROWS_AFFECTED_COLUMN: &str = "__rows_affected";

/// Render the call batch for `procedure`. Placeholders `@P1..` are numbered in the order
/// of the non-null inputs.
#[must_use]
pub fn call_batch(procedure: &str, params: &[BoundParameter]) -> String {
    let mut sql = String::from("DECLARE @__rc INT, @__rows BIGINT;\n");
    let mut placeholder = 0;
    for (i, param) in params.iter().enumerate() {
        let _ = write!(sql, "DECLARE @__p{i} {}", param.spec().declaration());
        match param.value() {
            Some(RowValues::Null) => sql.push_str(" = NULL"),
            Some(_) => {
                placeholder += 1;
                let _ = write!(sql, " = @P{placeholder}");
            }
            None => {}
        }
        sql.push_str(";\n");
    }

    let _ = write!(sql, "EXEC @__rc = {procedure}");
    for (i, param) in params.iter().enumerate() {
        let sep = if i == 0 { " " } else { ", " };
        let _ = write!(sql, "{sep}@{} = @__p{i}", param.name());
        if param.direction().returns_output() {
            sql.push_str(" OUTPUT");
        }
    }
    sql.push_str(";\nSET @__rows = ROWCOUNT_BIG();\n");

    let _ = write!(
        sql,
        "SELECT @__rc AS [{RETURN_CODE_COLUMN}], @__rows AS [{ROWS_AFFECTED_COLUMN}]"
    );
    for (i, param) in params.iter().enumerate() {
        if param.direction().returns_output() {
            let _ = write!(sql, ", @__p{i} AS [{}]", param.name());
        }
    }
    sql.push(';');
    sql
}

/// Bind the non-null input values in placeholder order.
fn bind_values<'a>(query: &mut Query<'a>, params: &[BoundParameter]) {
    for value in params.iter().filter_map(BoundParameter::value) {
        match value {
            RowValues::Int(i) => query.bind(*i),
            RowValues::Float(f) => query.bind(*f),
            RowValues::Text(s) => query.bind(s.clone()),
            RowValues::Bool(b) => query.bind(*b),
            RowValues::Timestamp(dt) => query.bind(*dt),
            RowValues::JSON(json) => query.bind(json.to_string()),
            RowValues::Blob(bytes) => query.bind(bytes.clone()),
            RowValues::Null => {}
        }
    }
}

/// Run the call batch and collect every result set, the outputs and the return code.
pub(crate) async fn run_procedure(
    client: &mut MssqlClient,
    procedure: &str,
    params: &[BoundParameter],
) -> Result<ProcedureOutput, SprocError> {
    let mut query = Query::new(call_batch(procedure, params));
    bind_values(&mut query, params);

    let mut stream = query.query(client).await.map_err(map_error)?;
    let mut sets: Vec<ResultSet> = Vec::new();
    while let Some(item) = stream.try_next().await.map_err(map_error)? {
        match item {
            QueryItem::Metadata(meta) => {
                let names: Vec<String> = meta
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let mut set = ResultSet::with_capacity(8);
                set.set_column_names(Arc::new(names));
                sets.push(set);
            }
            QueryItem::Row(row) => {
                let values = row
                    .into_iter()
                    .map(|data| column_value(&data))
                    .collect::<Result<Vec<_>, _>>()?;
                let set = sets.last_mut().ok_or_else(|| {
                    SprocError::Connectivity("SQL Server sent a row before its metadata".into())
                })?;
                set.add_row_values(values);
            }
        }
    }

    split_trailer(sets)
}

/// Separate the trailer set produced by [`call_batch`] from the procedure's own sets.
fn split_trailer(mut sets: Vec<ResultSet>) -> Result<ProcedureOutput, SprocError> {
    let is_trailer = sets.last().is_some_and(|set| {
        set.get_column_names()
            .and_then(|names| names.first())
            .is_some_and(|name| name == RETURN_CODE_COLUMN)
    });
    if !is_trailer {
        return Err(SprocError::Connectivity(
            "procedure batch ended without its status row".into(),
        ));
    }
    let trailer = sets.pop().unwrap_or_default();
    let row = trailer.iter().next().ok_or_else(|| {
        SprocError::Connectivity("procedure status result set was empty".into())
    })?;

    let mut output = ProcedureOutput {
        result_sets: sets,
        ..ProcedureOutput::default()
    };
    for (name, value) in row.iter() {
        match name {
            RETURN_CODE_COLUMN => {
                output.return_code = value.as_int().and_then(|v| i32::try_from(*v).ok());
            }
            ROWS_AFFECTED_COLUMN => {
                output.rows_affected = value.as_int().map_or(0, |v| u64::try_from(*v).unwrap_or(0));
            }
            _ => {
                output.output_values.insert(name.to_string(), value.clone());
            }
        }
    }
    Ok(output)
}

fn opt<T>(value: Option<T>, f: impl FnOnce(T) -> RowValues) -> RowValues {
    value.map_or(RowValues::Null, f)
}

/// Convert one Tiberius column value.
fn column_value(data: &ColumnData<'static>) -> Result<RowValues, SprocError> {
    let value = match data {
        ColumnData::U8(v) => opt(*v, |v| RowValues::Int(i64::from(v))),
        ColumnData::I16(v) => opt(*v, |v| RowValues::Int(i64::from(v))),
        ColumnData::I32(v) => opt(*v, |v| RowValues::Int(i64::from(v))),
        ColumnData::I64(v) => opt(*v, RowValues::Int),
        ColumnData::F32(v) => opt(*v, |v| RowValues::Float(f64::from(v))),
        ColumnData::F64(v) => opt(*v, RowValues::Float),
        ColumnData::Bit(v) => opt(*v, RowValues::Bool),
        ColumnData::String(v) => opt(v.as_ref(), |s| RowValues::Text(s.to_string())),
        ColumnData::Guid(v) => opt(v.as_ref(), |g| RowValues::Text(g.to_string())),
        ColumnData::Binary(v) => opt(v.as_ref(), |b| RowValues::Blob(b.to_vec())),
        #[allow(clippy::cast_precision_loss)]
        ColumnData::Numeric(v) => opt(*v, |n| {
            RowValues::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }),
        ColumnData::Xml(v) => opt(v.as_ref(), |x| {
            RowValues::Text(x.clone().into_owned().into_string())
        }),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            opt(NaiveDateTime::from_sql(data).map_err(map_error)?, RowValues::Timestamp)
        }
        ColumnData::Date(_) => opt(
            chrono::NaiveDate::from_sql(data).map_err(map_error)?,
            |d| RowValues::Timestamp(d.and_time(chrono::NaiveTime::MIN)),
        ),
        ColumnData::Time(_) => opt(
            chrono::NaiveTime::from_sql(data).map_err(map_error)?,
            |t| RowValues::Text(t.format("%H:%M:%S%.f").to_string()),
        ),
        ColumnData::DateTimeOffset(_) => opt(
            DateTime::<FixedOffset>::from_sql(data).map_err(map_error)?,
            |dt| RowValues::Timestamp(dt.naive_utc()),
        ),
    };
    Ok(value)
}
