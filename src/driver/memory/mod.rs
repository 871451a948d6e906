//! In-process database driver.
//!
//! Each `memory://name` endpoint maps to a [`MemoryDatabase`] in a shared
//! [`MemoryCatalog`]. Databases can be taken offline, slowed down or given a
//! replication lag so routing, breaker and health behaviour can be exercised
//! without a server.

mod engine;
mod parser;

use crate::connection::{Driver, DriverConnection};
use crate::core::{Result, RouterError, Value};
use crate::result::{QueryResult, command_tag};
use async_trait::async_trait;
use engine::Tables;
use parser::Statement;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// Named in-process databases shared by every driver built from the same
/// [`DriverFactory`](crate::driver::DriverFactory).
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    databases: Arc<Mutex<HashMap<String, MemoryDatabase>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the database called `name`, creating it on first use.
    pub fn database(&self, name: &str) -> MemoryDatabase {
        let mut databases = self
            .databases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        databases
            .entry(name.to_string())
            .or_insert_with(|| MemoryDatabase::new(name))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<MemoryDatabase> {
        self.databases.lock().ok()?.get(name).cloned()
    }
}

/// Handle to one in-process database. Clones share state.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    name: String,
    tables: Mutex<Tables>,
    online: AtomicBool,
    latency_ms: AtomicU64,
    replication_lag: Mutex<Option<Duration>>,
    statements_executed: AtomicU64,
    connections_opened: AtomicU64,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                name: name.into(),
                tables: Mutex::new(Tables::new()),
                online: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                replication_lag: Mutex::new(None),
                statements_executed: AtomicU64::new(0),
                connections_opened: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Offline databases refuse connections and fail every statement.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Delay applied before every statement.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_replication_lag(&self, lag: Option<Duration>) {
        if let Ok(mut current) = self.inner.replication_lag.lock() {
            *current = lag;
        }
    }

    /// Statements executed so far, transaction control included.
    pub fn statements_executed(&self) -> u64 {
        self.inner.statements_executed.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> u64 {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// Number of rows in `table`, or `None` if it does not exist.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.inner
            .tables
            .lock()
            .ok()?
            .get(table)
            .map(|t| t.rows.len())
    }

    pub fn open_connection(&self) -> Result<Box<dyn DriverConnection>> {
        if !self.is_online() {
            return Err(self.offline_error());
        }
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            db: self.clone(),
            transaction: None,
        }))
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.latency_ms.load(Ordering::SeqCst))
    }

    fn offline_error(&self) -> RouterError {
        RouterError::QueryExecution(format!(
            "could not connect to server: database \"{}\" is offline",
            self.inner.name
        ))
    }
}

pub struct MemoryDriver {
    db: MemoryDatabase,
}

impl MemoryDriver {
    pub fn new(db: MemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        self.db.open_connection()
    }
}

/// Snapshot taken at BEGIN plus the writes made since, replayed onto the
/// latest committed state at COMMIT.
struct Transaction {
    staged: Tables,
    journal: Vec<(Statement, Vec<Value>)>,
}

struct MemoryConnection {
    db: MemoryDatabase,
    transaction: Option<Transaction>,
}

impl MemoryConnection {
    async fn before_statement(&self) -> Result<()> {
        let latency = self.db.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.db.is_online() {
            return Err(self.db.offline_error());
        }
        self.db
            .inner
            .statements_executed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(RouterError::QueryExecution(
                "there is already a transaction in progress".into(),
            ));
        }
        let staged = self.db.inner.tables.lock()?.clone();
        self.transaction = Some(Transaction {
            staged,
            journal: Vec::new(),
        });
        Ok(())
    }

    fn finish_transaction(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.take() else {
            return Err(RouterError::QueryExecution(
                "there is no transaction in progress".into(),
            ));
        };

        let mut tables = self.db.inner.tables.lock()?;
        let mut next = tables.clone();
        for (statement, params) in &transaction.journal {
            engine::apply(&mut next, statement, params)?;
        }
        *tables = next;
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.before_statement().await?;
        trace!(db = %self.db.name(), sql, "executing");

        let statement = parser::parse(sql)?;
        let result = match statement {
            Statement::Begin => self.start_transaction().map(|_| QueryResult::empty("BEGIN")),
            Statement::Commit => self.finish_transaction().map(|_| QueryResult::empty("COMMIT")),
            Statement::Rollback => {
                self.transaction = None;
                Ok(QueryResult::empty("ROLLBACK"))
            }
            statement => match &mut self.transaction {
                Some(transaction) => {
                    let result = engine::apply(&mut transaction.staged, &statement, params)?;
                    if statement.is_write() {
                        transaction.journal.push((statement, params.to_vec()));
                    }
                    Ok(result)
                }
                None => {
                    let mut tables = self.db.inner.tables.lock()?;
                    engine::apply(&mut tables, &statement, params)
                }
            },
        }?;

        Ok(QueryResult {
            command: command_tag(sql),
            ..result
        })
    }

    async fn begin(&mut self) -> Result<()> {
        self.before_statement().await?;
        self.start_transaction()
    }

    async fn commit(&mut self) -> Result<()> {
        self.before_statement().await?;
        self.finish_transaction()
    }

    async fn rollback(&mut self) -> Result<()> {
        self.transaction = None;
        if !self.db.is_online() {
            return Err(self.db.offline_error());
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let latency = self.db.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.db.is_online() {
            return Err(self.db.offline_error());
        }
        Ok(())
    }

    async fn replication_lag(&mut self) -> Result<Option<Duration>> {
        Ok(*self.db.inner.replication_lag.lock()?)
    }

    fn is_broken(&self) -> bool {
        !self.db.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exec(conn: &mut Box<dyn DriverConnection>, sql: &str) -> Result<QueryResult> {
        conn.execute(sql, &[]).await
    }

    #[tokio::test]
    async fn test_autocommit_is_visible_to_other_connections() {
        let db = MemoryDatabase::new("autocommit");
        let mut a = db.open_connection().unwrap();
        let mut b = db.open_connection().unwrap();

        exec(&mut a, "CREATE TABLE t (id INTEGER PRIMARY KEY)").await.unwrap();
        exec(&mut a, "INSERT INTO t VALUES (1)").await.unwrap();

        let result = exec(&mut b, "SELECT * FROM t").await.unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.command, "SELECT");
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_transaction_isolated_until_commit() {
        let db = MemoryDatabase::new("isolation");
        let mut writer = db.open_connection().unwrap();
        let mut reader = db.open_connection().unwrap();
        exec(&mut writer, "CREATE TABLE t (id INTEGER PRIMARY KEY)").await.unwrap();

        writer.begin().await.unwrap();
        exec(&mut writer, "INSERT INTO t VALUES (1)").await.unwrap();
        assert_eq!(exec(&mut writer, "SELECT * FROM t").await.unwrap().row_count, 1);
        assert_eq!(exec(&mut reader, "SELECT * FROM t").await.unwrap().row_count, 0);

        writer.commit().await.unwrap();
        assert_eq!(db.row_count("t"), Some(1));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let db = MemoryDatabase::new("rollback");
        let mut conn = db.open_connection().unwrap();
        exec(&mut conn, "CREATE TABLE t (id INTEGER)").await.unwrap();

        conn.begin().await.unwrap();
        exec(&mut conn, "INSERT INTO t VALUES (1), (2)").await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(db.row_count("t"), Some(0));
    }

    #[tokio::test]
    async fn test_conflicting_commit_fails_and_keeps_committed_state() {
        let db = MemoryDatabase::new("conflict");
        let mut a = db.open_connection().unwrap();
        let mut b = db.open_connection().unwrap();
        exec(&mut a, "CREATE TABLE t (id INTEGER PRIMARY KEY)").await.unwrap();

        a.begin().await.unwrap();
        exec(&mut a, "INSERT INTO t VALUES (7)").await.unwrap();
        exec(&mut b, "INSERT INTO t VALUES (7)").await.unwrap();

        assert!(a.commit().await.is_err());
        assert_eq!(db.row_count("t"), Some(1));
    }

    #[tokio::test]
    async fn test_offline_database() {
        let db = MemoryDatabase::new("offline");
        let mut conn = db.open_connection().unwrap();

        db.set_online(false);
        assert!(conn.is_broken());
        assert!(conn.ping().await.is_err());
        assert!(exec(&mut conn, "SELECT 1").await.is_err());
        assert!(db.open_connection().is_err());

        db.set_online(true);
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_statements() {
        let db = MemoryDatabase::new("slow");
        db.set_latency(Duration::from_millis(250));
        let mut conn = db.open_connection().unwrap();

        let started = tokio::time::Instant::now();
        exec(&mut conn, "SELECT 1").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(db.statements_executed(), 1);
    }

    #[tokio::test]
    async fn test_replication_lag_is_reported() {
        let db = MemoryDatabase::new("replica");
        let mut conn = db.open_connection().unwrap();
        assert_eq!(conn.replication_lag().await.unwrap(), None);

        db.set_replication_lag(Some(Duration::from_millis(1500)));
        assert_eq!(
            conn.replication_lag().await.unwrap(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_catalog_shares_databases() {
        let catalog = MemoryCatalog::new();
        let a = catalog.database("users");
        let b = catalog.database("users");
        a.set_online(false);
        assert!(!b.is_online());
        assert!(catalog.get("missing").is_none());
    }
}
