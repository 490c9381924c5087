//! Provider error code classification.
//!
//! SQL Server reports failures as numbered errors. [`classify`] maps a number to an
//! [`ErrorCategory`] once, where the error enters the crate; the rest of the crate only
//! looks at the category.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Client-side command timeout. Not a server error number; matches the value ADO.NET
/// reports for an expired command timeout.
pub const CLIENT_TIMEOUT: i32 = -2;

/// Client-side code used when a call fails at the transport layer mid-flight.
pub const CLIENT_TRANSPORT: i32 = -1;

/// First error number available to `RAISERROR`/`THROW` in user code.
pub const USER_DEFINED_BASE: i32 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Transient
    Deadlock,
    Timeout,
    Throttled,
    ServiceUnavailable,
    ConcurrencyConflict,
    // Fatal
    ConstraintViolation,
    Syntax,
    Permission,
    Validation,
    Other,
}

impl ErrorCategory {
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCategory::Deadlock
                | ErrorCategory::Timeout
                | ErrorCategory::Throttled
                | ErrorCategory::ServiceUnavailable
                | ErrorCategory::ConcurrencyConflict
        )
    }

    #[must_use]
    pub fn safe_message(self) -> &'static str {
        match self {
            ErrorCategory::Deadlock | ErrorCategory::ConcurrencyConflict => {
                "The operation conflicted with concurrent activity; try again."
            }
            ErrorCategory::Timeout => "The operation timed out.",
            ErrorCategory::Throttled => "The data source is busy; try again later.",
            ErrorCategory::ServiceUnavailable => "The data source is temporarily unavailable.",
            ErrorCategory::ConstraintViolation => "The operation violates a data constraint.",
            ErrorCategory::Syntax => "The operation is not correctly defined.",
            ErrorCategory::Permission => "The operation is not permitted.",
            ErrorCategory::Validation => "The request was rejected by data validation.",
            ErrorCategory::Other => "The operation failed.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Deadlock => "deadlock",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Throttled => "throttled",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::ConcurrencyConflict => "concurrency_conflict",
            ErrorCategory::ConstraintViolation => "constraint_violation",
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Other => "other",
        };
        f.write_str(name)
    }
}

/// Map a provider error number to its category.
#[must_use]
pub fn classify(code: i32) -> ErrorCategory {
    match code {
        1205 => ErrorCategory::Deadlock,
        CLIENT_TIMEOUT | 1222 => ErrorCategory::Timeout,
        40501 | 10928 | 10929 | 10922 | 10936 | 49918 | 49919 | 49920 | 4221 => {
            ErrorCategory::Throttled
        }
        CLIENT_TRANSPORT | 20 | 64 | 121 | 233 | 4060 | 10053 | 10054 | 10060 | 40143
        | 40197 | 40613 => ErrorCategory::ServiceUnavailable,
        3960 | 41301 | 41302 | 41305 | 41325 | 41839 => ErrorCategory::ConcurrencyConflict,
        515 | 547 | 2601 | 2627 => ErrorCategory::ConstraintViolation,
        102 | 105 | 156 | 170 | 207 | 208 | 2812 => ErrorCategory::Syntax,
        229 | 230 | 262 | 297 | 300 | 916 | 18456 => ErrorCategory::Permission,
        201 | 245 | 2628 | 8114 | 8144 | 8152 => ErrorCategory::Validation,
        c if c >= USER_DEFINED_BASE => ErrorCategory::Validation,
        _ => ErrorCategory::Other,
    }
}
