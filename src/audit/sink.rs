use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::AuditEvent;
use crate::error::SprocError;
use crate::params::{ParameterMarshaller, ParameterSpec, ProcedureContract, SqlType};
use crate::provider::ConnectionProvider;
use crate::types::RowValues;

/// Durable destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist `events` in order, all or nothing: after an error none of them may have
    /// been kept, because the batch is written again.
    ///
    /// # Errors
    /// A retryable error (see [`SprocError::is_retryable`]) means the sink is currently
    /// unavailable and the batch is retried later. Any other error means the sink refuses
    /// the content; the emitter then writes the events one by one and drops the ones that
    /// are still refused.
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SprocError>;
}

/// Keeps events in memory. Can be switched unavailable to simulate an outage.
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    available: AtomicBool,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    #[must_use]
    pub fn for_correlation(&self, correlation_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.correlation_id() == correlation_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SprocError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SprocError::Connectivity("audit sink unavailable".into()));
        }
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Appends one JSON document per event to a file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesAuditSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SprocError> {
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event).map_err(|e| {
                SprocError::Configuration(format!("audit event not serializable: {e}"))
            })?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let io_err = |e: std::io::Error| {
            SprocError::Connectivity(format!("audit log {}: {e}", self.path.display()))
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&buf).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }
}

/// Emits each event as a structured `tracing` event under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SprocError> {
        for event in events {
            tracing::info!(
                target: "audit",
                event_id = %event.event_id(),
                timestamp = %event.timestamp(),
                correlation_id = event.correlation_id(),
                actor_id = event.actor_id(),
                operation = %event.operation(),
                entity = event.entity(),
                entity_id = event.entity_id(),
                connection_id = event.connection_id(),
                success = event.success(),
                duration_ms = u64::try_from(event.duration().as_millis()).unwrap_or(u64::MAX),
                attempts = event.attempts(),
                error = event.error_message(),
                machine = %event.host().machine_name,
                application = %event.host().application_name,
                "audit event"
            );
        }
        Ok(())
    }
}

/// Writes events through a stored procedure on a dedicated pooled connection.
///
/// Each write checks out its own connection, so audit rows never join a business
/// transaction and survive its rollback. A batch is written inside its own transaction.
pub struct ProcedureAuditSink {
    provider: Arc<ConnectionProvider>,
    connection_id: String,
    contract: Arc<ProcedureContract>,
}

impl ProcedureAuditSink {
    /// # Errors
    /// Returns `SprocError::Validation` if `procedure` is not a valid procedure name.
    pub fn new(
        provider: Arc<ConnectionProvider>,
        connection_id: impl Into<String>,
        procedure: &str,
    ) -> Result<Self, SprocError> {
        Ok(Self {
            provider,
            connection_id: connection_id.into(),
            contract: Arc::new(Self::contract(procedure)?),
        })
    }

    /// Parameters the audit procedure is expected to declare.
    ///
    /// # Errors
    /// Returns `SprocError::Validation` if `procedure` is not a valid procedure name.
    pub fn contract(procedure: &str) -> Result<ProcedureContract, SprocError> {
        ProcedureContract::new(
            procedure,
            vec![
                ParameterSpec::input("EventId", SqlType::UniqueIdentifier),
                ParameterSpec::input("Timestamp", SqlType::DateTime2),
                ParameterSpec::input("CorrelationId", SqlType::NVarChar).max_length(128),
                ParameterSpec::input("ActorId", SqlType::NVarChar)
                    .max_length(128)
                    .nullable(),
                ParameterSpec::input("Operation", SqlType::VarChar).max_length(16),
                ParameterSpec::input("Entity", SqlType::NVarChar).max_length(256),
                ParameterSpec::input("EntityId", SqlType::NVarChar)
                    .max_length(256)
                    .nullable(),
                ParameterSpec::input("Success", SqlType::Bit),
                ParameterSpec::input("DurationMs", SqlType::BigInt),
                ParameterSpec::input("Attempts", SqlType::Int),
                ParameterSpec::input("ErrorMessage", SqlType::NVarChar).nullable(),
                ParameterSpec::input("BeforeJson", SqlType::NVarChar).nullable(),
                ParameterSpec::input("AfterJson", SqlType::NVarChar).nullable(),
                ParameterSpec::input("MachineName", SqlType::NVarChar).max_length(256),
                ParameterSpec::input("ApplicationName", SqlType::NVarChar).max_length(256),
            ],
        )
    }

    fn event_values(event: &AuditEvent) -> HashMap<String, RowValues> {
        let json_text = |v: Option<&serde_json::Value>| v.map(ToString::to_string);
        let pairs: [(&str, RowValues); 15] = [
            ("EventId", event.event_id().to_string().into()),
            ("Timestamp", RowValues::Timestamp(event.timestamp().naive_utc())),
            ("CorrelationId", event.correlation_id().into()),
            ("ActorId", event.actor_id().map(str::to_string).into()),
            ("Operation", event.operation().to_string().into()),
            ("Entity", event.entity().into()),
            ("EntityId", event.entity_id().map(str::to_string).into()),
            ("Success", event.success().into()),
            (
                "DurationMs",
                RowValues::Int(i64::try_from(event.duration().as_millis()).unwrap_or(i64::MAX)),
            ),
            ("Attempts", RowValues::Int(i64::from(event.attempts()))),
            ("ErrorMessage", event.error_message().map(str::to_string).into()),
            ("BeforeJson", json_text(event.before()).into()),
            ("AfterJson", json_text(event.after()).into()),
            ("MachineName", event.host().machine_name.as_str().into()),
            ("ApplicationName", event.host().application_name.as_str().into()),
        ];
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

#[async_trait]
impl AuditSink for ProcedureAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SprocError> {
        let marshaller = ParameterMarshaller::default();
        let calls = events
            .iter()
            .map(|event| marshaller.bind(&self.contract, &Self::event_values(event)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.provider.acquire(&self.connection_id).await?;
        let db = conn.db();
        db.begin().await?;
        let mut written = Ok(());
        for bound in &calls {
            if let Err(err) = db.call_procedure(self.contract.name(), bound).await {
                written = Err(err);
                break;
            }
        }
        let outcome = match written {
            Ok(()) => {
                let committed = db.commit().await;
                if committed.is_err() {
                    db.mark_broken();
                }
                committed
            }
            Err(err) => {
                if !db.is_broken() && db.rollback().await.is_err() {
                    db.mark_broken();
                }
                Err(err)
            }
        };
        if conn.is_broken() {
            conn.discard();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::OperationKind;

    fn event(correlation: &str) -> AuditEvent {
        AuditEvent::builder(correlation, OperationKind::Execute, "sp_Test").build()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_sink_outage() {
        let sink = MemoryAuditSink::new();
        sink.set_available(false);
        assert!(sink.write_batch(&[event("a")]).await.is_err());
        sink.set_available(true);
        sink.write_batch(&[event("a"), event("b")]).await.unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.for_correlation("b").len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn json_lines_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesAuditSink::new(dir.path().join("audit.jsonl"));
        sink.write_batch(&[event("a")]).await.unwrap();
        sink.write_batch(&[event("b"), event("c")]).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let parsed: Vec<AuditEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let ids: Vec<_> = parsed.iter().map(AuditEvent::correlation_id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn procedure_sink_values_fit_contract() {
        let contract = ProcedureAuditSink::contract("dbo.usp_WriteAudit").unwrap();
        let values = ProcedureAuditSink::event_values(&event("a"));
        let bound = ParameterMarshaller::strict().bind(&contract, &values).unwrap();
        assert_eq!(bound.len(), contract.parameters().len());
    }
}
