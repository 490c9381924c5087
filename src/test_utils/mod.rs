//! Test support: an in-memory procedure backend and a ready-wired gateway.
//!
//! ```rust,ignore
//! # async fn demo() -> Result<(), sproc_middleware::SprocError> {
//! use sproc_middleware::prelude::*;
//! use sproc_middleware::test_utils::{TestEnv, procedures};
//!
//! let env = TestEnv::new()?;
//! procedures::seed_values(&env.db, &[10, 20, 30]);
//! let result = env
//!     .gateway
//!     .execute_strict(TestEnv::MAIN, &procedures::reader(), &params! { "MinValue" => 15 }, &CallOptions::new("c-1"))
//!     .await?;
//! assert_eq!(result.first_set().map(ResultSet::len), Some(2));
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod procedures;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::audit::{AuditEmitter, AuditEvent, MemoryAuditSink};
use crate::config::{AuditConfig, ConnectionDefinition, MiddlewareConfig, RetryConfig};
use crate::context::HostContext;
use crate::error::SprocError;
use crate::gateway::ProcedureGateway;
use crate::provider::SecretResolver;
use memory::{MemoryConnectionFactory, MemoryDatabase};

/// Secret resolver whose values can be changed while in use, to simulate rotation.
#[derive(Debug, Default)]
pub struct SharedSecretResolver {
    secrets: RwLock<HashMap<String, String>>,
}

impl SharedSecretResolver {
    pub fn set(&self, name: &str, value: &str) {
        self.secrets
            .write()
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.secrets.write().remove(name);
    }
}

#[async_trait]
impl SecretResolver for SharedSecretResolver {
    async fn resolve(&self, secret_name: &str) -> Result<String, SprocError> {
        self.secrets
            .read()
            .get(secret_name)
            .cloned()
            .ok_or_else(|| SprocError::SecretUnavailable(format!("no secret named '{secret_name}'")))
    }
}

/// A gateway over a [`MemoryDatabase`] with the sample procedures installed and a
/// [`MemoryAuditSink`] behind its audit emitter. Must be built inside a Tokio runtime.
pub struct TestEnv {
    pub gateway: ProcedureGateway,
    pub db: MemoryDatabase,
    pub audit: Arc<MemoryAuditSink>,
    pub secrets: Arc<SharedSecretResolver>,
}

impl TestEnv {
    pub const MAIN: &'static str = "main";

    /// One connection, `main`, with fast retries and a short audit retry delay.
    #[must_use]
    pub fn config() -> MiddlewareConfig {
        MiddlewareConfig::default()
            .with_connection(ConnectionDefinition::new(Self::MAIN))
            .with_retry(RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 10,
                multiplier: 2.0,
            })
            .with_audit(AuditConfig {
                retry_delay_ms: 10,
                ..AuditConfig::default()
            })
            .with_host(HostContext::new("test-host", "sproc-middleware-tests"))
    }

    /// # Errors
    /// See [`TestEnv::with_config`].
    pub fn new() -> Result<Self, SprocError> {
        Self::with_config(Self::config())
    }

    /// Each configured connection resolves to `memory://<id>`.
    ///
    /// # Errors
    /// `SprocError::Configuration` for an invalid configuration or outside a runtime.
    pub fn with_config(config: MiddlewareConfig) -> Result<Self, SprocError> {
        let db = MemoryDatabase::new();
        procedures::install(&db);

        let secrets = Arc::new(SharedSecretResolver::default());
        for connection in &config.connections {
            secrets.set(connection.secret_name(), &format!("memory://{}", connection.id));
        }

        let audit = Arc::new(MemoryAuditSink::new());
        let emitter = AuditEmitter::new(audit.clone(), &config.audit, config.host.clone())?;
        let gateway = ProcedureGateway::new(
            &config,
            secrets.clone(),
            Arc::new(MemoryConnectionFactory::new(db.clone())),
            Arc::new(emitter),
        )?;
        Ok(Self {
            gateway,
            db,
            audit,
            secrets,
        })
    }

    /// Every audit event written so far, after draining the emitter.
    ///
    /// # Errors
    /// Propagates [`AuditEmitter::flush`] failures.
    pub async fn audit_events(&self) -> Result<Vec<AuditEvent>, SprocError> {
        self.gateway.audit().flush().await?;
        Ok(self.audit.events())
    }
}
