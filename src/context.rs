//! Per-process and per-call context.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditTarget;

/// Identity of the running process, handed explicitly to the components that stamp it on
/// audit events and connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostContext {
    pub machine_name: String,
    pub application_name: String,
}

impl HostContext {
    #[must_use]
    pub fn new(machine_name: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            application_name: application_name.into(),
        }
    }

    /// Host name from `HOSTNAME`/`COMPUTERNAME`, application name from this crate.
    #[must_use]
    pub fn from_environment() -> Self {
        let machine_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            machine_name,
            application_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::from_environment()
    }
}

/// Options for one logical operation.
///
/// The correlation id is supplied by the caller and never generated here, so that one id
/// links the caller's logs, the audit event, and any failure report.
#[derive(Debug, Clone)]
pub struct CallOptions {
    correlation_id: String,
    actor_id: Option<String>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    audit: Option<AuditTarget>,
}

impl CallOptions {
    #[must_use]
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            actor_id: None,
            timeout: None,
            cancel: CancellationToken::new(),
            audit: None,
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Command timeout for each attempt. Defaults to the configured execution timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Describe the operation for the audit trail. Defaults to an `Execute` of the
    /// procedure name.
    #[must_use]
    pub fn audit(mut self, target: AuditTarget) -> Self {
        self.audit = Some(target);
        self
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
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn audit_target(&self) -> Option<&AuditTarget> {
        self.audit.as_ref()
    }
}
