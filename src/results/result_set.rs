use std::collections::HashMap;
use std::sync::Arc;

use super::row::{ResultRow, index_columns};
use crate::types::RowValues;

/// One result set returned by a procedure.
///
/// Result sets are read fully before the call returns; no server-side cursor is held.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// The rows returned by the procedure
    pub results: Vec<ResultRow>,
    /// Column names shared by all rows (to avoid duplicating in each row)
    column_names: Option<Arc<Vec<String>>>,
    column_index: Option<Arc<HashMap<String, usize>>>,
}

impl ResultSet {
    /// Create a new result set with a known capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            column_names: None,
            column_index: None,
        }
    }

    /// Create an empty result set with the given columns.
    #[must_use]
    pub fn with_columns(column_names: Vec<String>) -> ResultSet {
        let mut set = ResultSet::default();
        set.set_column_names(Arc::new(column_names));
        set
    }

    /// Set the column names for this result set (to be shared by all rows)
    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_index = Some(Arc::new(index_columns(&column_names)));
        self.column_names = Some(column_names);
    }

    /// Get the column names for this result set
    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Add a row to the result set. Ignored until column names are set.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        if let (Some(column_names), Some(column_index)) = (&self.column_names, &self.column_index)
        {
            self.results.push(ResultRow {
                column_names: column_names.clone(),
                values: row_values,
                column_index: column_index.clone(),
            });
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// First column of the first row, if any.
    #[must_use]
    pub fn first_value(&self) -> Option<&RowValues> {
        self.results.first().and_then(|row| row.get_by_index(0))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultRow> {
        self.results.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = ResultRow;
    type IntoIter = std::vec::IntoIter<ResultRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a ResultRow;
    type IntoIter = std::slice::Iter<'a, ResultRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_share_columns() {
        let mut set = ResultSet::with_columns(vec!["a".into(), "b".into()]);
        set.add_row_values(vec![RowValues::Int(1), RowValues::Text("x".into())]);
        set.add_row_values(vec![RowValues::Int(2), RowValues::Null]);
        assert_eq!(set.len(), 2);
        assert!(Arc::ptr_eq(
            &set.results[0].column_names,
            &set.results[1].column_names
        ));
        assert_eq!(set.first_value(), Some(&RowValues::Int(1)));
    }

    #[test]
    fn rows_without_columns_are_dropped() {
        let mut set = ResultSet::default();
        set.add_row_values(vec![RowValues::Int(1)]);
        assert!(set.is_empty());
    }
}
