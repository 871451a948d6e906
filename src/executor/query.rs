use crate::breaker::{BreakerRegistry, CircuitState};
use crate::connection::pool::ConnectionPool;
use crate::core::{Result, RouterError, Value};
use crate::result::{QueryResult, command_tag, is_read_command, is_transaction_control};
use crate::routing::{Operation, ReplicaSelector, Target};
use crate::shard::Shard;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one statement routed to a shard.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub result: QueryResult,
    pub shard: String,
    /// `primary` or the replica id that served the call
    pub target: String,
    /// Operation actually performed, after read-to-write upgrades
    pub operation: Operation,
    pub elapsed: Duration,
    pub breaker_state: CircuitState,
}

/// Runs single statements through a shard's breaker and pools.
pub struct QueryExecutor {
    breakers: Arc<BreakerRegistry>,
    default_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(breakers: Arc<BreakerRegistry>, default_timeout: Duration) -> Self {
        Self {
            breakers,
            default_timeout,
        }
    }

    pub async fn execute(
        &self,
        shard: &Shard,
        sql: &str,
        params: &[Value],
        operation: Operation,
        timeout: Option<Duration>,
    ) -> Result<QueryOutcome> {
        if sql.trim().is_empty() {
            return Err(RouterError::Validation("Query must not be empty".into()));
        }
        if is_transaction_control(sql) {
            return Err(RouterError::Validation(format!(
                "{} is not allowed in a single query; send the statements as a transaction",
                command_tag(sql)
            )));
        }

        let operation = match operation {
            Operation::Read if !is_read_command(sql) => {
                debug!(shard = %shard.id(), "statement is not a read, sending to primary");
                Operation::Write
            }
            Operation::Transaction => Operation::Write,
            other => other,
        };
        let timeout = timeout.unwrap_or(self.default_timeout);

        let breaker = self.breakers.get(shard.id());
        let permit = breaker.try_acquire().inspect_err(|_| shard.metrics().record_rejected())?;

        let started = Instant::now();
        let (pool, target) = ReplicaSelector::select(shard, operation);
        let outcome = run_statement(pool, sql, params, timeout).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(result) => {
                permit.succeed();
                shard.metrics().record_success(elapsed);
                result
            }
            Err(err) if err.is_caller_error() => {
                permit.release();
                debug!(shard = %shard.id(), "query rejected: {}", err);
                return Err(err);
            }
            Err(err) => {
                permit.fail();
                shard.metrics().record_error();
                warn!(
                    shard = %shard.id(),
                    operation = operation.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query failed: {}", err
                );
                return Err(err);
            }
        };

        Ok(QueryOutcome {
            result,
            shard: shard.id().to_string(),
            target: match target {
                Target::Primary => "primary".to_string(),
                Target::Replica(id) => id.to_string(),
            },
            operation,
            elapsed,
            breaker_state: breaker.state(),
        })
    }
}

/// Acquire, execute, release. The connection goes back to the pool on
/// every path except a timeout, where it is discarded.
async fn run_statement(
    pool: &ConnectionPool,
    sql: &str,
    params: &[Value],
    timeout: Duration,
) -> Result<QueryResult> {
    let mut guard = pool.get_connection().await?;

    let outcome = tokio::time::timeout(timeout, async {
        let connection = guard.connection();
        connection.set_statement_timeout(timeout).await?;
        connection.execute(sql, params).await
    })
    .await;

    match outcome {
        Ok(result) => {
            guard.close();
            result
        }
        Err(_) => {
            guard.discard();
            Err(RouterError::QueryExecution(format!(
                "canceling statement due to statement timeout ({}ms)",
                timeout.as_millis()
            )))
        }
    }
}
