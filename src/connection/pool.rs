use super::{Connection, Driver, config::PoolConfig};
use crate::core::{Result, RouterError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Bounded connection pool for one database endpoint.
///
/// At most `max_connections` connections are checked out at once; callers
/// beyond that wait up to `connect_timeout` for one to be released.
pub struct ConnectionPool {
    /// Label used in logs, e.g. `shard-users/primary`
    name: String,
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    /// Idle connections
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// One permit per connection that may be checked out
    permits: Arc<Semaphore>,
    /// Total number of open connections (idle + checked out)
    total_connections: Arc<AtomicUsize>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// An idle connection
struct PooledConnection {
    connection: Connection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.last_used.elapsed() > timeout)
    }
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first acquisition
    /// or an explicit `warm_up`.
    pub fn new(name: impl Into<String>, config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate()?;

        let permits = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            name: name.into(),
            config,
            driver,
            available: Arc::new(Mutex::new(VecDeque::new())),
            permits,
            total_connections: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::UnavailableShard(format!(
                "Connection pool '{}' is closed",
                self.name
            )));
        }

        let permit = match tokio::time::timeout(
            self.config.connect_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(RouterError::UnavailableShard(format!(
                    "Connection pool '{}' is closed",
                    self.name
                )));
            }
            Err(_) => {
                return Err(RouterError::QueryExecution(format!(
                    "Connection pool '{}' timeout: no connections available after {}ms",
                    self.name,
                    self.config.connect_timeout.as_millis()
                )));
            }
        };

        let (connection, created_at) = match self.try_get_available()? {
            Some(pooled) => (pooled.connection, pooled.created_at),
            None => (self.create_connection().await?, Instant::now()),
        };

        Ok(PoolGuard {
            connection,
            created_at,
            pool_name: self.name.clone(),
            available: Arc::clone(&self.available),
            total_connections: Arc::clone(&self.total_connections),
            _permit: permit,
        })
    }

    /// Pop an idle connection, discarding expired ones on the way
    fn try_get_available(&self) -> Result<Option<PooledConnection>> {
        let mut available = self.available.lock()?;

        while let Some(pooled) = available.pop_front() {
            if pooled.is_expired(self.config.max_lifetime)
                || pooled.is_idle_too_long(self.config.idle_timeout)
            {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                debug!(pool = %self.name, connection = pooled.connection.id(), "expired idle connection");
                continue;
            }
            return Ok(Some(pooled));
        }

        Ok(None)
    }

    async fn create_connection(&self) -> Result<Connection> {
        let inner = self.driver.connect().await.map_err(|err| match err {
            RouterError::QueryExecution(message) => RouterError::QueryExecution(format!(
                "Failed to connect to '{}': {}",
                self.name, message
            )),
            other => other,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        debug!(pool = %self.name, driver = self.driver.name(), connection = id, "opened connection");

        Ok(Connection::new(id, inner))
    }

    /// Open connections until `min_connections` are idle in the pool.
    pub async fn warm_up(&self) -> Result<()> {
        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = self.create_connection().await?;
            self.available.lock()?.push_back(PooledConnection {
                connection,
                created_at: Instant::now(),
                last_used: Instant::now(),
            });
        }
        Ok(())
    }

    /// One liveness round trip, bounded by `timeout` end to end.
    ///
    /// The connection is released as soon as the ping resolves.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let outcome = tokio::time::timeout(timeout, async {
            let mut guard = self.get_connection().await?;
            match guard.connection().ping().await {
                Ok(()) => {
                    guard.close();
                    Ok(())
                }
                Err(err) => {
                    guard.discard();
                    Err(err)
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(RouterError::QueryExecution(format!(
                "Liveness probe for '{}' timed out after {}ms",
                self.name,
                timeout.as_millis()
            ))),
        }
    }

    /// Replication delay reported by the endpoint, if any.
    pub async fn replication_lag(&self, timeout: Duration) -> Result<Option<Duration>> {
        let outcome = tokio::time::timeout(timeout, async {
            let mut guard = self.get_connection().await?;
            let lag = guard.connection().replication_lag().await;
            guard.close();
            lag
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(RouterError::QueryExecution(format!(
                "Replication lag query for '{}' timed out",
                self.name
            )))
        })
    }

    /// Reject further acquisitions and drop idle connections.
    ///
    /// Checked-out connections are dropped when their guards are released.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        match self.available.lock() {
            Ok(mut available) => {
                let dropped = available.len();
                available.clear();
                self.total_connections.fetch_sub(dropped, Ordering::SeqCst);
            }
            Err(err) => warn!(pool = %self.name, "pool lock poisoned while closing: {}", err),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.available.lock().map(|a| a.len()).unwrap_or(0);
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: idle,
            active_connections: total.saturating_sub(idle),
            max_connections: self.config.max_connections,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} connections in use, {} idle (limit {})",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped, unless the connection
/// is still inside a transaction or broken, in which case it is discarded.
pub struct PoolGuard {
    connection: Connection,
    /// When the physical connection was opened, kept across checkouts
    created_at: Instant,
    pool_name: String,
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Return the connection to the pool.
    pub fn close(self) {}

    /// Drop the connection instead of returning it, e.g. after a timeout
    /// left it in an unknown state.
    pub fn discard(mut self) {
        debug!(pool = %self.pool_name, connection = self.connection.id(), "discarding connection");
        self.connection.close();
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let mut connection = self.connection.take();

        if !connection.is_reusable() {
            if connection.is_in_transaction() {
                warn!(
                    pool = %self.pool_name,
                    connection = connection.id(),
                    "connection released with an open transaction; discarding it"
                );
            }
            connection.close();
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match self.available.lock() {
            Ok(mut available) => available.push_back(PooledConnection {
                connection,
                created_at: self.created_at,
                last_used: Instant::now(),
            }),
            Err(_) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
