//! An in-process procedure backend.
//!
//! Procedures are Rust closures over a set of tables. Each call stages its effects on a
//! copy of the data and applies them only when the call completes, so a call that is
//! timed out or cancelled leaves nothing behind. Transactions work on a snapshot taken at
//! `begin`; `commit` applies the rows the transaction inserted, changed or deleted.
//!
//! Applying a change merges it row by row into the shared data, so concurrent sessions
//! touching different rows all keep their writes. Two sessions changing the same row
//! resolve as last writer wins. Identities are drawn from a per-table counter shared by
//! every session and, as on SQL Server, are not reused after a rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{ConnectionFactory, DbConnection, ProcedureOutput};
use crate::error::{DatabaseError, SprocError};
use crate::params::BoundParameter;
use crate::results::ResultSet;
use crate::types::RowValues;

/// Column values of one stored row.
pub type Record = HashMap<String, RowValues>;

/// Rows keyed by an identity assigned on insert.
#[derive(Debug, Clone, Default)]
pub struct Table {
    identity: Arc<AtomicI64>,
    rows: BTreeMap<i64, Record>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
    }
}

impl Table {
    /// Insert `record`, storing the generated identity under `Id`.
    pub fn insert(&mut self, mut record: Record) -> i64 {
        let id = self.identity.fetch_add(1, Ordering::SeqCst) + 1;
        record.insert("Id".to_string(), RowValues::Int(id));
        self.rows.insert(id, record);
        id
    }

    #[must_use]
    pub fn get(&self, id: i64) -> Option<&Record> {
        self.rows.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Record> {
        self.rows.get_mut(&id)
    }

    pub fn remove(&mut self, id: i64) -> Option<Record> {
        self.rows.remove(&id)
    }

    /// Rows in identity order.
    pub fn rows(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Every table of a [`MemoryDatabase`]. Clones share the identity counters.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    tables: HashMap<String, Table>,
    identities: Arc<Mutex<HashMap<String, Arc<AtomicI64>>>>,
}

impl PartialEq for Tables {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables
    }
}

impl Tables {
    /// The table named `name`, created empty on first use.
    pub fn table(&mut self, name: &str) -> &mut Table {
        let identities = &self.identities;
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Table {
                identity: identities.lock().entry(name.to_string()).or_default().clone(),
                rows: BTreeMap::new(),
            })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Apply the rows `staged` inserted, changed or deleted relative to `base`.
    fn merge(&mut self, base: &Tables, staged: Tables) {
        for (name, table) in staged.tables {
            let before = base.tables.get(&name);
            if before == Some(&table) {
                continue;
            }
            let target = self.table(&name);
            if let Some(before) = before {
                for id in before.rows.keys().filter(|id| !table.rows.contains_key(*id)) {
                    target.rows.remove(id);
                }
            }
            for (id, row) in table.rows {
                if before.and_then(|b| b.rows.get(&id)) != Some(&row) {
                    target.rows.insert(id, row);
                }
            }
        }
    }
}

struct Transaction {
    base: Tables,
    working: Tables,
}

/// What a procedure body sees and produces during one call.
pub struct CallScope<'a> {
    args: HashMap<String, RowValues>,
    tables: &'a mut Tables,
    output: ProcedureOutput,
    delay: Duration,
}

impl CallScope<'_> {
    /// Value bound to `name`; Output placeholders and unknown names read as NULL.
    #[must_use]
    pub fn arg(&self, name: &str) -> &RowValues {
        self.args
            .get(&name.to_ascii_lowercase())
            .unwrap_or(&RowValues::Null)
    }

    /// # Errors
    /// `SprocError::Database` with error 8114 when the argument is not an integer.
    pub fn int_arg(&self, name: &str) -> Result<i64, SprocError> {
        self.arg(name)
            .as_int()
            .copied()
            .ok_or_else(|| conversion_error(name, "int"))
    }

    /// # Errors
    /// `SprocError::Database` with error 8114 when the argument is not text.
    pub fn text_arg(&self, name: &str) -> Result<String, SprocError> {
        self.arg(name)
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| conversion_error(name, "nvarchar"))
    }

    pub fn table(&mut self, name: &str) -> &mut Table {
        self.tables.table(name)
    }

    pub fn result_set(&mut self, set: ResultSet) {
        self.output.result_sets.push(set);
    }

    pub fn set_output(&mut self, name: &str, value: impl Into<RowValues>) {
        self.output
            .output_values
            .insert(name.to_string(), value.into());
    }

    pub fn set_return_code(&mut self, code: i32) {
        self.output.return_code = Some(code);
    }

    pub fn add_rows_affected(&mut self, rows: u64) {
        self.output.rows_affected += rows;
    }

    /// Hold the call open for `delay` before it completes.
    pub fn delay(&mut self, delay: Duration) {
        self.delay = delay;
    }
}

fn conversion_error(name: &str, to: &str) -> SprocError {
    DatabaseError::from_code(8114, format!("Error converting parameter @{name} to {to}.")).into()
}

/// A procedure body.
pub type ProcedureFn = Arc<dyn Fn(&mut CallScope<'_>) -> Result<(), SprocError> + Send + Sync>;

/// A failure injected into upcoming calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// The server raises the given error number.
    Database(i32),
    /// The connection drops mid-call.
    Connectivity,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    procedures: Mutex<HashMap<String, ProcedureFn>>,
    failures: Mutex<HashMap<String, (u32, ScriptedFailure)>>,
    connect_failures: Mutex<u32>,
    commit_failures: Mutex<u32>,
    calls: Mutex<HashMap<String, u32>>,
    connection_strings: Mutex<Vec<String>>,
    connects: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Shared state behind every connection opened by a [`MemoryConnectionFactory`].
///
/// Cloning shares the same database.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        body: impl Fn(&mut CallScope<'_>) -> Result<(), SprocError> + Send + Sync + 'static,
    ) {
        self.inner
            .procedures
            .lock()
            .insert(name.to_ascii_lowercase(), Arc::new(body));
    }

    /// Insert committed rows into `table`, returning their identities.
    pub fn seed(&self, table: &str, records: impl IntoIterator<Item = Record>) -> Vec<i64> {
        let mut tables = self.inner.tables.lock();
        let table = tables.table(table);
        records.into_iter().map(|r| table.insert(r)).collect()
    }

    /// Committed rows of `table`, in identity order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.inner
            .tables
            .lock()
            .get(table)
            .map(|t| t.rows().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `times` calls to `procedure` fail with `failure`.
    pub fn fail_next(&self, procedure: &str, times: u32, failure: ScriptedFailure) {
        self.inner
            .failures
            .lock()
            .insert(procedure.to_ascii_lowercase(), (times, failure));
    }

    /// Make the next `times` connection attempts fail.
    pub fn fail_connects(&self, times: u32) {
        *self.inner.connect_failures.lock() = times;
    }

    /// Make the next `times` commits fail with a transport error.
    pub fn fail_commits(&self, times: u32) {
        *self.inner.commit_failures.lock() = times;
    }

    /// Calls that reached `procedure`, scripted failures included.
    #[must_use]
    pub fn call_count(&self, procedure: &str) -> u32 {
        self.inner
            .calls
            .lock()
            .get(&procedure.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    /// Connection strings of every successful connect, oldest first.
    #[must_use]
    pub fn connection_strings(&self) -> Vec<String> {
        self.inner.connection_strings.lock().clone()
    }

    fn take_failure(&self, procedure: &str) -> Option<ScriptedFailure> {
        let mut failures = self.inner.failures.lock();
        let (remaining, failure) = failures.get_mut(procedure)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(failure.clone())
    }

    fn take_counter(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("connects", &self.connect_count())
            .finish_non_exhaustive()
    }
}

/// Opens [`MemoryConnection`]s on one [`MemoryDatabase`], whatever the connection string.
#[derive(Debug, Clone)]
pub struct MemoryConnectionFactory {
    db: MemoryDatabase,
}

impl MemoryConnectionFactory {
    #[must_use]
    pub fn new(db: MemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn DbConnection>, SprocError> {
        if MemoryDatabase::take_counter(&self.db.inner.connect_failures) {
            return Err(SprocError::Connectivity(
                "memory database refused the connection".into(),
            ));
        }
        self.db.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.db
            .inner
            .connection_strings
            .lock()
            .push(connection_string.to_string());
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            transaction: None,
            broken: false,
        }))
    }
}

/// One session on a [`MemoryDatabase`].
pub struct MemoryConnection {
    db: MemoryDatabase,
    transaction: Option<Transaction>,
    broken: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), SprocError> {
        if self.broken {
            return Err(SprocError::Connectivity("connection is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DbConnection for MemoryConnection {
    async fn call_procedure(
        &mut self,
        procedure: &str,
        params: &[BoundParameter],
    ) -> Result<ProcedureOutput, SprocError> {
        self.ensure_open()?;
        let key = procedure.to_ascii_lowercase();
        *self.db.inner.calls.lock().entry(key.clone()).or_insert(0) += 1;

        match self.db.take_failure(&key) {
            Some(ScriptedFailure::Database(code)) => {
                return Err(DatabaseError::from_code(
                    code,
                    format!("scripted failure {code} in {procedure}"),
                )
                .into());
            }
            Some(ScriptedFailure::Connectivity) => {
                self.broken = true;
                return Err(SprocError::Connectivity(format!(
                    "connection dropped during {procedure}"
                )));
            }
            None => {}
        }

        let body = self.db.inner.procedures.lock().get(&key).cloned();
        let body = body.ok_or_else(|| {
            SprocError::from(DatabaseError::from_code(
                2812,
                format!("Could not find stored procedure '{procedure}'."),
            ))
        })?;

        let base = match &self.transaction {
            Some(tx) => tx.working.clone(),
            None => self.db.inner.tables.lock().clone(),
        };
        let mut staged = base.clone();
        let args = params
            .iter()
            .map(|p| {
                let value = p.value().cloned().unwrap_or(RowValues::Null);
                (p.name().to_ascii_lowercase(), value)
            })
            .collect();
        let mut scope = CallScope {
            args,
            tables: &mut staged,
            output: ProcedureOutput {
                return_code: Some(0),
                ..ProcedureOutput::default()
            },
            delay: Duration::ZERO,
        };
        body(&mut scope)?;
        let CallScope { output, delay, .. } = scope;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match &mut self.transaction {
            Some(tx) => tx.working = staged,
            None => self.db.inner.tables.lock().merge(&base, staged),
        }
        Ok(output)
    }

    async fn begin(&mut self) -> Result<(), SprocError> {
        self.ensure_open()?;
        if self.transaction.is_some() {
            return Err(DatabaseError::from_code(
                3902,
                "nested transactions are not supported by the memory database",
            )
            .into());
        }
        let base = self.db.inner.tables.lock().clone();
        self.transaction = Some(Transaction {
            working: base.clone(),
            base,
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SprocError> {
        self.ensure_open()?;
        let Some(tx) = self.transaction.take() else {
            return Err(DatabaseError::from_code(
                3902,
                "The COMMIT TRANSACTION request has no corresponding BEGIN TRANSACTION.",
            )
            .into());
        };
        if MemoryDatabase::take_counter(&self.db.inner.commit_failures) {
            self.broken = true;
            return Err(SprocError::Connectivity(
                "connection dropped during commit".into(),
            ));
        }
        self.db.inner.tables.lock().merge(&tx.base, tx.working);
        self.db.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SprocError> {
        self.ensure_open()?;
        if self.transaction.take().is_some() {
            self.db.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), SprocError> {
        self.ensure_open()
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("in_transaction", &self.transaction.is_some())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterMarshaller, ParameterSpec, ProcedureContract, SqlType};

    fn counter_db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.register("sp_Add", |scope| {
            let value = scope.int_arg("Value")?;
            let id = scope
                .table("Items")
                .insert(HashMap::from([("Value".to_string(), RowValues::Int(value))]));
            scope.set_output("NewId", id);
            scope.add_rows_affected(1);
            Ok(())
        });
        db
    }

    fn add_params(value: i64) -> Vec<BoundParameter> {
        let contract = ProcedureContract::new(
            "sp_Add",
            vec![
                ParameterSpec::input("Value", SqlType::Int),
                ParameterSpec::output("NewId", SqlType::Int),
            ],
        )
        .unwrap();
        let values = HashMap::from([("Value".to_string(), RowValues::Int(value))]);
        ParameterMarshaller::default().bind(&contract, &values).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn uncommitted_work_is_invisible() {
        let db = counter_db();
        let factory = MemoryConnectionFactory::new(db.clone());
        let mut conn = factory.connect("memory").await.unwrap();

        conn.begin().await.unwrap();
        let out = conn.call_procedure("sp_Add", &add_params(3)).await.unwrap();
        assert_eq!(out.output_values.get("NewId"), Some(&RowValues::Int(1)));
        assert!(db.rows("Items").is_empty());
        conn.rollback().await.unwrap();
        assert!(!conn.in_transaction());
        assert!(db.rows("Items").is_empty());
        assert_eq!(db.rollback_count(), 1);

        conn.call_procedure("sp_Add", &add_params(4)).await.unwrap();
        assert_eq!(db.rows("Items").len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_sessions_keep_each_others_writes() {
        let db = counter_db();
        db.register("sp_SlowAdd", |scope| {
            let value = scope.int_arg("Value")?;
            scope
                .table("Items")
                .insert(HashMap::from([("Value".to_string(), RowValues::Int(value))]));
            scope.delay(Duration::from_millis(30));
            Ok(())
        });
        let factory = MemoryConnectionFactory::new(db.clone());
        let mut slow = factory.connect("memory").await.unwrap();
        let mut fast = factory.connect("memory").await.unwrap();
        let mut tx = factory.connect("memory").await.unwrap();

        tx.begin().await.unwrap();
        tx.call_procedure("sp_Add", &add_params(3)).await.unwrap();
        let slow_params = add_params(1);
        let fast_params = add_params(2);
        let (slow_out, fast_out) = tokio::join!(
            slow.call_procedure("sp_SlowAdd", &slow_params),
            fast.call_procedure("sp_Add", &fast_params),
        );
        slow_out.unwrap();
        fast_out.unwrap();
        tx.commit().await.unwrap();

        let mut values: Vec<i64> = db
            .rows("Items")
            .iter()
            .filter_map(|row| row.get("Value").and_then(RowValues::as_int).copied())
            .collect();
        values.sort_unstable();
        assert_eq!(values, [1, 2, 3]);

        let mut ids: Vec<i64> = db
            .rows("Items")
            .iter()
            .filter_map(|row| row.get("Id").and_then(RowValues::as_int).copied())
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_procedure_is_a_database_error() {
        let factory = MemoryConnectionFactory::new(MemoryDatabase::new());
        let mut conn = factory.connect("memory").await.unwrap();
        let err = conn.call_procedure("sp_Missing", &[]).await.unwrap_err();
        assert!(matches!(err, SprocError::Database(ref db) if db.code == 2812));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_failures_run_out() {
        let db = counter_db();
        db.fail_next("sp_Add", 1, ScriptedFailure::Database(1205));
        db.fail_connects(1);
        let factory = MemoryConnectionFactory::new(db.clone());

        assert!(factory.connect("memory").await.is_err());
        let mut conn = factory.connect("memory").await.unwrap();
        let err = conn
            .call_procedure("sp_Add", &add_params(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(db.call_count("sp_add"), 1);
        assert_eq!(db.connect_count(), 1);
    }
}
