//! Audit trail.
//!
//! One [`AuditEvent`] is recorded per logical operation, whatever its outcome. Events are
//! queued by a non-blocking [`AuditEmitter`] and written in batches to an [`AuditSink`] by
//! a background task.

mod emitter;
mod event;
mod sink;

pub use emitter::AuditEmitter;
pub use event::{AuditEvent, AuditEventBuilder, AuditTarget, OperationKind};
pub use sink::{AuditSink, JsonLinesAuditSink, MemoryAuditSink, ProcedureAuditSink, TracingAuditSink};
