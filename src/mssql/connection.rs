use async_trait::async_trait;
use tiberius::Query;

use super::MssqlClient;
use super::error::map_error;
use super::query::run_procedure;
use crate::backend::{DbConnection, ProcedureOutput};
use crate::error::SprocError;
use crate::params::BoundParameter;

/// One SQL Server session.
pub struct MssqlConnection {
    client: MssqlClient,
    in_transaction: bool,
    broken: bool,
}

impl MssqlConnection {
    #[must_use]
    pub fn new(client: MssqlClient) -> Self {
        Self {
            client,
            in_transaction: false,
            broken: false,
        }
    }

    async fn simple(&mut self, sql: &'static str) -> Result<(), SprocError> {
        let result = Query::new(sql).execute(&mut self.client).await;
        result.map(|_| ()).map_err(|e| self.observe(map_error(e)))
    }

    fn observe(&mut self, err: SprocError) -> SprocError {
        if matches!(err, SprocError::Connectivity(_)) {
            self.broken = true;
        }
        err
    }
}

#[async_trait]
impl DbConnection for MssqlConnection {
    async fn call_procedure(
        &mut self,
        procedure: &str,
        params: &[BoundParameter],
    ) -> Result<ProcedureOutput, SprocError> {
        let result = run_procedure(&mut self.client, procedure, params).await;
        result.map_err(|e| self.observe(e))
    }

    async fn begin(&mut self) -> Result<(), SprocError> {
        self.simple("BEGIN TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SprocError> {
        let result = self.simple("COMMIT TRANSACTION").await;
        self.in_transaction = false;
        result
    }

    async fn rollback(&mut self) -> Result<(), SprocError> {
        // A severe error may already have ended the transaction server-side.
        let result = self.simple("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await;
        self.in_transaction = false;
        result
    }

    async fn ping(&mut self) -> Result<(), SprocError> {
        self.simple("SELECT 1").await
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl std::fmt::Debug for MssqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlConnection")
            .field("in_transaction", &self.in_transaction)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
