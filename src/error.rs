use clap::ValueEnum;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::{ErrorCategory, classify};

/// Error type for every fallible operation in the middleware.
///
/// The variants follow the failure taxonomy callers branch on. Backend-specific errors
/// never escape as-is: each backend converts its native error into one of these variants
/// at the boundary, and database errors are classified exactly once when they are built
/// (see [`DatabaseError::from_code`]).
#[derive(Debug, Clone, Error)]
pub enum SprocError {
    /// Missing, malformed, or unknown parameters. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown connection identifier or invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network, handshake, or pool checkout failure.
    #[error("Connection error: {0}")]
    Connectivity(String),

    /// The secret store could not produce a connection string.
    #[error("Secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Transaction misuse (begin while active, commit while idle, ...).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// The circuit for the named target is open; the call was not attempted.
    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),

    /// The audit buffer is full and the event could not be queued.
    #[error("Audit buffer full: {0}")]
    AuditBufferFull(String),
}

/// A classified error raised by the database while executing a call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Database error {code} ({category}): {message}")]
pub struct DatabaseError {
    /// Provider error number (SQL Server error number, or a negative client code).
    pub code: i32,
    pub category: ErrorCategory,
    /// Raw provider message. Kept for the audit trail; never shown to callers.
    pub message: String,
}

impl DatabaseError {
    /// Build a database error, classifying the provider code.
    #[must_use]
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            category: classify(code),
            message: message.into(),
        }
    }

    /// A client-side command timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::from_code(crate::classify::CLIENT_TIMEOUT, message)
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category.is_transient()
    }
}

/// Flat discriminant of [`SprocError`], used in failure reports and audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    Connectivity,
    SecretUnavailable,
    TransientDatabase,
    FatalDatabase,
    InvalidState,
    Cancelled,
    CircuitOpen,
    AuditBufferFull,
}

/// Structured failure handed to end users: enough to file a support ticket, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: String,
}

impl SprocError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SprocError::Validation(_) => ErrorKind::Validation,
            SprocError::Configuration(_) => ErrorKind::Configuration,
            SprocError::Connectivity(_) => ErrorKind::Connectivity,
            SprocError::SecretUnavailable(_) => ErrorKind::SecretUnavailable,
            SprocError::Database(db) if db.is_transient() => ErrorKind::TransientDatabase,
            SprocError::Database(_) => ErrorKind::FatalDatabase,
            SprocError::InvalidState(_) => ErrorKind::InvalidState,
            SprocError::Cancelled => ErrorKind::Cancelled,
            SprocError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            SprocError::AuditBufferFull(_) => ErrorKind::AuditBufferFull,
        }
    }

    /// Whether the retry policy may attempt the operation again.
    ///
    /// Transient database errors and infrastructure reachability failures qualify;
    /// everything else is surfaced immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SprocError::Database(db) => db.is_transient(),
            SprocError::Connectivity(_) | SprocError::SecretUnavailable(_) => true,
            _ => false,
        }
    }

    /// Database category, when this is a database error.
    #[must_use]
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            SprocError::Database(db) => Some(db.category),
            _ => None,
        }
    }

    /// Caller-safe message: no provider text, no connection details.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            // Validation messages are produced by the marshaller and only name fields.
            SprocError::Validation(msg) => format!("Invalid request: {msg}"),
            SprocError::Configuration(_) => "The requested data source is not configured.".into(),
            SprocError::Connectivity(_) | SprocError::SecretUnavailable(_) => {
                "The data source is currently unreachable.".into()
            }
            SprocError::Database(db) => db.category.safe_message().into(),
            SprocError::InvalidState(_) => "The transaction is not in a valid state for this operation.".into(),
            SprocError::Cancelled => "The operation was cancelled.".into(),
            SprocError::CircuitOpen(_) => {
                "The data source is temporarily unavailable; try again later.".into()
            }
            SprocError::AuditBufferFull(_) => "The operation could not be recorded.".into(),
        }
    }

    /// Detailed message for audit events and operational logs, with secrets redacted.
    #[must_use]
    pub fn detailed_message(&self) -> String {
        redact_secrets(&self.to_string())
    }

    #[must_use]
    pub fn to_failure(&self, correlation_id: &str) -> FailureReport {
        FailureReport {
            kind: self.kind(),
            message: self.safe_message(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

lazy_static! {
    static ref SECRET_PAIR: Regex = Regex::new(
        r"(?i)\b(password|pwd|user id|uid|accountkey|sharedaccesskey|access ?token)\s*=\s*[^;]*"
    )
    .expect("secret redaction pattern is valid");
}

/// Replace `key=value` pairs that look like credentials with `key=***`.
#[must_use]
pub fn redact_secrets(text: &str) -> String {
    SECRET_PAIR.replace_all(text, "$1=***").into_owned()
}
