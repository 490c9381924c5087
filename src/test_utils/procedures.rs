//! Sample procedures over a `TestData (Id, Name, Value)` table, with their contracts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::memory::{CallScope, MemoryDatabase, Record};
use crate::error::{DatabaseError, SprocError};
use crate::params::{ParameterSpec, ProcedureContract, SqlType};
use crate::results::ResultSet;
use crate::types::RowValues;

pub const TEST_TABLE: &str = "TestData";

const COLUMNS: [&str; 3] = ["Id", "Name", "Value"];

fn record_values(record: &Record) -> Vec<RowValues> {
    COLUMNS
        .iter()
        .map(|c| record.get(*c).cloned().unwrap_or(RowValues::Null))
        .collect()
}

fn data_set() -> ResultSet {
    ResultSet::with_columns(COLUMNS.iter().map(|c| (*c).to_string()).collect())
}

/// A `TestData` record.
#[must_use]
pub fn record(name: &str, value: i64) -> Record {
    HashMap::from([
        ("Name".to_string(), RowValues::Text(name.to_string())),
        ("Value".to_string(), RowValues::Int(value)),
    ])
}

/// Seed one row per value, named `item-<value>`.
pub fn seed_values(db: &MemoryDatabase, values: &[i64]) -> Vec<i64> {
    db.seed(
        TEST_TABLE,
        values.iter().map(|v| record(&format!("item-{v}"), *v)),
    )
}

fn insert(scope: &mut CallScope<'_>) -> Result<i64, SprocError> {
    let name = scope.text_arg("Name")?;
    let value = scope.int_arg("Value")?;
    let id = scope.table(TEST_TABLE).insert(record(&name, value));
    scope.add_rows_affected(1);
    Ok(id)
}

/// Register every sample procedure on `db`.
pub fn install(db: &MemoryDatabase) {
    db.register("sp_TestReader", |scope| {
        let min = scope.int_arg("MinValue")?;
        let mut set = data_set();
        for row in scope.table(TEST_TABLE).rows() {
            if row.get("Value").and_then(RowValues::as_int).is_some_and(|v| *v >= min) {
                set.add_row_values(record_values(row));
            }
        }
        scope.result_set(set);
        Ok(())
    });

    db.register("sp_TestNonQuery", |scope| {
        let id = insert(scope)?;
        scope.set_output("NewId", id);
        Ok(())
    });

    db.register("sp_TestInsert", |scope| insert(scope).map(|_| ()));

    db.register("sp_TestScalar", |scope| {
        let id = scope.int_arg("Id")?;
        let mut set = ResultSet::with_columns(vec!["Name".to_string()]);
        if let Some(row) = scope.table(TEST_TABLE).get(id) {
            set.add_row_values(vec![row.get("Name").cloned().unwrap_or(RowValues::Null)]);
        }
        scope.result_set(set);
        Ok(())
    });

    db.register("sp_TestDelay", |scope| {
        let ms = scope.int_arg("DelayMs")?;
        scope.delay(Duration::from_millis(u64::try_from(ms).unwrap_or(0)));
        Ok(())
    });

    db.register("sp_TestFail", |scope| {
        let message = match scope.arg("Message") {
            RowValues::Text(text) => text.clone(),
            _ => "deliberate failure".to_string(),
        };
        Err(DatabaseError::from_code(50_000, message).into())
    });

    db.register("sp_TestGet", |scope| {
        let id = scope.int_arg("Id")?;
        let mut set = data_set();
        if let Some(row) = scope.table(TEST_TABLE).get(id) {
            set.add_row_values(record_values(row));
        }
        scope.result_set(set);
        Ok(())
    });

    db.register("sp_TestList", |scope| {
        let page = scope.int_arg("PageNumber")?;
        let size = scope.int_arg("PageSize")?;
        let skip = usize::try_from((page - 1).max(0) * size).unwrap_or(usize::MAX);
        let take = usize::try_from(size).unwrap_or(0);

        let table = scope.table(TEST_TABLE);
        let mut rows = data_set();
        for row in table.rows().skip(skip).take(take) {
            rows.add_row_values(record_values(row));
        }
        let total = i64::try_from(table.len()).unwrap_or(i64::MAX);
        let mut count = ResultSet::with_columns(vec!["TotalCount".to_string()]);
        count.add_row_values(vec![RowValues::Int(total)]);

        scope.result_set(rows);
        scope.result_set(count);
        Ok(())
    });

    db.register("sp_TestUpdate", |scope| {
        let id = scope.int_arg("Id")?;
        let name = scope.text_arg("Name")?;
        let value = scope.int_arg("Value")?;
        let updated = match scope.table(TEST_TABLE).get_mut(id) {
            Some(row) => {
                row.insert("Name".to_string(), RowValues::Text(name));
                row.insert("Value".to_string(), RowValues::Int(value));
                true
            }
            None => false,
        };
        if updated {
            scope.add_rows_affected(1);
        }
        Ok(())
    });

    db.register("sp_TestDelete", |scope| {
        let id = scope.int_arg("Id")?;
        if scope.table(TEST_TABLE).remove(id).is_some() {
            scope.add_rows_affected(1);
        }
        Ok(())
    });
}

fn contract(name: &str, parameters: Vec<ParameterSpec>) -> Arc<ProcedureContract> {
    ProcedureContract::shared(name, parameters).expect("sample contract is valid")
}

#[must_use]
pub fn reader() -> Arc<ProcedureContract> {
    contract(
        "sp_TestReader",
        vec![ParameterSpec::input("MinValue", SqlType::Int)],
    )
}

#[must_use]
pub fn non_query() -> Arc<ProcedureContract> {
    contract(
        "sp_TestNonQuery",
        vec![
            ParameterSpec::input("Name", SqlType::NVarChar).max_length(100),
            ParameterSpec::input("Value", SqlType::Int),
            ParameterSpec::output("NewId", SqlType::Int),
        ],
    )
}

#[must_use]
pub fn insert_contract() -> Arc<ProcedureContract> {
    contract(
        "sp_TestInsert",
        vec![
            ParameterSpec::input("Name", SqlType::NVarChar).max_length(100),
            ParameterSpec::input("Value", SqlType::Int),
        ],
    )
}

#[must_use]
pub fn scalar() -> Arc<ProcedureContract> {
    contract("sp_TestScalar", vec![ParameterSpec::input("Id", SqlType::Int)])
}

#[must_use]
pub fn delay() -> Arc<ProcedureContract> {
    contract(
        "sp_TestDelay",
        vec![ParameterSpec::input("DelayMs", SqlType::Int)],
    )
}

#[must_use]
pub fn fail() -> Arc<ProcedureContract> {
    contract(
        "sp_TestFail",
        vec![
            ParameterSpec::input("Message", SqlType::NVarChar)
                .max_length(200)
                .nullable(),
        ],
    )
}

#[must_use]
pub fn get() -> Arc<ProcedureContract> {
    contract("sp_TestGet", vec![ParameterSpec::input("Id", SqlType::Int)])
}

#[must_use]
pub fn list() -> Arc<ProcedureContract> {
    contract(
        "sp_TestList",
        vec![
            ParameterSpec::input("PageNumber", SqlType::Int),
            ParameterSpec::input("PageSize", SqlType::Int),
        ],
    )
}

#[must_use]
pub fn update() -> Arc<ProcedureContract> {
    contract(
        "sp_TestUpdate",
        vec![
            ParameterSpec::input("Id", SqlType::Int),
            ParameterSpec::input("Name", SqlType::NVarChar).max_length(100),
            ParameterSpec::input("Value", SqlType::Int),
        ],
    )
}

#[must_use]
pub fn delete() -> Arc<ProcedureContract> {
    contract("sp_TestDelete", vec![ParameterSpec::input("Id", SqlType::Int)])
}
