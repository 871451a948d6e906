pub mod config;
pub mod pool;

use crate::core::{Result, RouterError, Value};
use crate::result::{QueryResult, command_tag, is_transaction_control};
use async_trait::async_trait;
use std::time::Duration;

/// A database driver bound to one endpoint.
///
/// Implementations open physical connections; pooling, timeouts and
/// routing live above this seam.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short driver name for logs (`postgres`, `memory`).
    fn name(&self) -> &'static str;

    /// Open a new physical connection.
    async fn connect(&self) -> Result<Box<dyn DriverConnection>>;
}

/// A single physical connection opened by a [`Driver`].
#[async_trait]
pub trait DriverConnection: Send {
    /// Execute one parameterized statement.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Trivial liveness query.
    async fn ping(&mut self) -> Result<()> {
        self.execute("SELECT 1", &[]).await.map(|_| ())
    }

    /// Ask the server to abort statements running longer than `timeout`.
    async fn set_statement_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// Replication delay behind the primary, when the server reports one.
    async fn replication_lag(&mut self) -> Result<Option<Duration>> {
        Ok(None)
    }

    /// True once the underlying transport is unusable.
    fn is_broken(&self) -> bool {
        false
    }
}

/// Pooled connection handle.
///
/// Tracks transaction state on top of the driver connection so the pool
/// knows whether a connection can be handed to the next caller.
pub struct Connection {
    /// Unique connection ID within its pool
    id: u64,
    inner: Box<dyn DriverConnection>,
    state: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}

impl Connection {
    pub(crate) fn new(id: u64, inner: Box<dyn DriverConnection>) -> Self {
        Self {
            id,
            inner,
            state: ConnectionState::Active,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Execute one statement. Transaction boundaries go through `begin`,
    /// `commit` and `rollback` so the tracked state matches the server's.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.ensure_open()?;
        if is_transaction_control(sql) {
            return Err(RouterError::Validation(format!(
                "{} must not be sent as a plain statement",
                command_tag(sql)
            )));
        }
        self.inner.execute(sql, params).await
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;

        if self.state == ConnectionState::InTransaction {
            return Err(RouterError::QueryExecution(
                "Transaction already active".into(),
            ));
        }

        self.inner.begin().await?;
        self.state = ConnectionState::InTransaction;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(RouterError::QueryExecution("No active transaction".into()));
        }

        // A failed COMMIT ends the transaction server-side as well.
        self.state = ConnectionState::Active;
        self.inner.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(RouterError::QueryExecution("No active transaction".into()));
        }

        self.state = ConnectionState::Active;
        self.inner.rollback().await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.inner.ping().await
    }

    pub async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.inner.set_statement_timeout(timeout).await
    }

    pub async fn replication_lag(&mut self) -> Result<Option<Duration>> {
        self.ensure_open()?;
        self.inner.replication_lag().await
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Whether the connection can go back to the idle set.
    pub fn is_reusable(&self) -> bool {
        self.state == ConnectionState::Active && !self.inner.is_broken()
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Move the connection out, leaving a closed, detached handle behind.
    pub(crate) fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            inner: std::mem::replace(&mut self.inner, Box::new(Detached)),
            state: std::mem::replace(&mut self.state, ConnectionState::Closed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(closed());
        }
        Ok(())
    }
}

fn closed() -> RouterError {
    RouterError::QueryExecution("Connection is closed".into())
}

/// What a [`Connection`] holds once its driver connection was taken.
struct Detached;

#[async_trait]
impl DriverConnection for Detached {
    async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<QueryResult> {
        Err(closed())
    }

    async fn begin(&mut self) -> Result<()> {
        Err(closed())
    }

    async fn commit(&mut self) -> Result<()> {
        Err(closed())
    }

    async fn rollback(&mut self) -> Result<()> {
        Err(closed())
    }

    fn is_broken(&self) -> bool {
        true
    }
}
