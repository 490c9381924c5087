use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::context::HostContext;
use crate::error::{ErrorKind, SprocError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
    Execute,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// What a call does, as far as the audit trail is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTarget {
    pub operation: OperationKind,
    pub entity: String,
    pub entity_id: Option<String>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

impl AuditTarget {
    #[must_use]
    pub fn new(operation: OperationKind, entity: impl Into<String>) -> Self {
        Self {
            operation,
            entity: entity.into(),
            entity_id: None,
            before: None,
            after: None,
        }
    }

    /// An `Execute` of the named procedure.
    #[must_use]
    pub fn execute(procedure: impl Into<String>) -> Self {
        Self::new(OperationKind::Execute, procedure)
    }

    #[must_use]
    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn before(mut self, snapshot: JsonValue) -> Self {
        self.before = Some(snapshot);
        self
    }

    #[must_use]
    pub fn after(mut self, snapshot: JsonValue) -> Self {
        self.after = Some(snapshot);
        self
    }
}

/// Immutable record of one logical operation.
///
/// Only [`AuditEventBuilder::build`] creates events; there are no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    event_id: Uuid,
    timestamp: DateTime<Utc>,
    correlation_id: String,
    actor_id: Option<String>,
    operation: OperationKind,
    entity: String,
    entity_id: Option<String>,
    connection_id: Option<String>,
    success: bool,
    duration_ms: u64,
    attempts: u32,
    error_kind: Option<ErrorKind>,
    error_message: Option<String>,
    before: Option<JsonValue>,
    after: Option<JsonValue>,
    host: HostContext,
}

impl AuditEvent {
    #[must_use]
    pub fn builder(
        correlation_id: impl Into<String>,
        operation: OperationKind,
        entity: impl Into<String>,
    ) -> AuditEventBuilder {
        AuditEventBuilder::new(correlation_id.into(), AuditTarget::new(operation, entity))
    }

    #[must_use]
    pub fn for_target(correlation_id: impl Into<String>, target: AuditTarget) -> AuditEventBuilder {
        AuditEventBuilder::new(correlation_id.into(), target)
    }

    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    #[must_use]
    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Executor attempts behind this operation (retries included).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Detailed, secret-redacted error message.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[must_use]
    pub fn before(&self) -> Option<&JsonValue> {
        self.before.as_ref()
    }

    #[must_use]
    pub fn after(&self) -> Option<&JsonValue> {
        self.after.as_ref()
    }

    #[must_use]
    pub fn host(&self) -> &HostContext {
        &self.host
    }
}

#[derive(Debug, Clone)]
pub struct AuditEventBuilder {
    correlation_id: String,
    target: AuditTarget,
    actor_id: Option<String>,
    connection_id: Option<String>,
    duration: Duration,
    attempts: u32,
    error: Option<(ErrorKind, String)>,
    host: Option<HostContext>,
}

impl AuditEventBuilder {
    fn new(correlation_id: String, target: AuditTarget) -> Self {
        Self {
            correlation_id,
            target,
            actor_id: None,
            connection_id: None,
            duration: Duration::ZERO,
            attempts: 1,
            error: None,
            host: None,
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.target.entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn before(mut self, snapshot: JsonValue) -> Self {
        self.target.before = Some(snapshot);
        self
    }

    #[must_use]
    pub fn after(mut self, snapshot: JsonValue) -> Self {
        self.target.after = Some(snapshot);
        self
    }

    /// Mark the operation failed with `error`.
    #[must_use]
    pub fn failed(mut self, error: &SprocError) -> Self {
        self.error = Some((error.kind(), error.detailed_message()));
        self
    }

    /// Mark the operation failed, or leave it successful when `error` is `None`.
    #[must_use]
    pub fn outcome(self, error: Option<&SprocError>) -> Self {
        match error {
            Some(err) => self.failed(err),
            None => self,
        }
    }

    #[must_use]
    pub fn host(mut self, host: HostContext) -> Self {
        self.host = Some(host);
        self
    }

    /// Stamp the event with a fresh id and the current UTC time.
    #[must_use]
    pub fn build(self) -> AuditEvent {
        let (error_kind, error_message) = match self.error {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };
        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            actor_id: self.actor_id,
            operation: self.target.operation,
            entity: self.target.entity,
            entity_id: self.target.entity_id,
            connection_id: self.connection_id,
            success: error_kind.is_none(),
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            attempts: self.attempts,
            error_kind,
            error_message,
            before: self.target.before,
            after: self.target.after,
            host: self.host.unwrap_or_default(),
        }
    }
}
