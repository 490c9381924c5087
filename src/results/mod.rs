mod execution;
mod result_set;
mod row;

pub use execution::{ExecutionResult, NonQueryResult};
pub use result_set::ResultSet;
pub use row::ResultRow;
