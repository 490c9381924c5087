//! Stored procedure executor.
//!
//! - `targets`: where a call runs (pooled connection or unit of work)
//! - `call`: the single-call engine with timeout, cancellation and output merging

mod call;
mod targets;

pub use call::StoredProcedureExecutor;
pub use targets::ExecTarget;
