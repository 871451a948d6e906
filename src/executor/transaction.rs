// ============================================================================
// Transaction Executor
// ============================================================================
//
// Runs an ordered batch of statements on one connection to a shard's
// primary: BEGIN, each statement in order, COMMIT. Any failure rolls the
// whole batch back and surfaces as `TransactionAbort`.
//
// ============================================================================

use crate::breaker::{BreakerRegistry, CircuitState};
use crate::connection::Connection;
use crate::core::{Result, RouterError, Value};
use crate::result::{QueryResult, command_tag, is_transaction_control};
use crate::routing::{Operation, ReplicaSelector};
use crate::shard::Shard;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// One statement of a transaction batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchStatement {
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl BatchStatement {
    pub fn new(query: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    /// Per-statement results, in batch order
    pub results: Vec<QueryResult>,
    pub shard: String,
    pub elapsed: Duration,
    pub breaker_state: CircuitState,
}

impl TransactionOutcome {
    pub fn statements_executed(&self) -> usize {
        self.results.len()
    }
}

pub struct TransactionExecutor {
    breakers: Arc<BreakerRegistry>,
    default_timeout: Duration,
}

impl TransactionExecutor {
    pub fn new(breakers: Arc<BreakerRegistry>, default_timeout: Duration) -> Self {
        Self {
            breakers,
            default_timeout,
        }
    }

    /// Execute `statements` atomically on the shard's primary.
    ///
    /// `timeout` bounds the whole batch, BEGIN to COMMIT.
    pub async fn execute(
        &self,
        shard: &Shard,
        statements: &[BatchStatement],
        timeout: Option<Duration>,
    ) -> Result<TransactionOutcome> {
        validate_batch(statements)?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        let breaker = self.breakers.get(shard.id());
        let permit = breaker.try_acquire().inspect_err(|_| shard.metrics().record_rejected())?;

        let started = Instant::now();
        let (pool, _) = ReplicaSelector::select(shard, Operation::Transaction);

        let outcome = match pool.get_connection().await {
            Ok(mut guard) => {
                let batch = tokio::time::timeout(timeout, run_batch(guard.connection(), statements, timeout)).await;
                match batch {
                    Ok(result) => {
                        guard.close();
                        result
                    }
                    Err(_) => {
                        // Dropping the connection ends the server-side transaction.
                        guard.discard();
                        Err(RouterError::TransactionAbort {
                            failed_statement: None,
                            message: format!("transaction timed out after {}ms", timeout.as_millis()),
                        })
                    }
                }
            }
            Err(err) => Err(abort(None, err)),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(results) => {
                permit.succeed();
                shard.metrics().record_batch(results.len() as u64, elapsed);
                Ok(TransactionOutcome {
                    results,
                    shard: shard.id().to_string(),
                    elapsed,
                    breaker_state: breaker.state(),
                })
            }
            Err(err) if err.is_caller_error() => {
                permit.release();
                Err(err)
            }
            Err(err) => {
                permit.fail();
                shard.metrics().record_error();
                warn!(
                    shard = %shard.id(),
                    statements = statements.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "transaction aborted: {}", err
                );
                Err(err)
            }
        }
    }
}

fn validate_batch(statements: &[BatchStatement]) -> Result<()> {
    if statements.is_empty() {
        return Err(RouterError::Validation(
            "Transaction must contain at least one statement".into(),
        ));
    }
    for (index, statement) in statements.iter().enumerate() {
        if statement.query.trim().is_empty() {
            return Err(RouterError::Validation(format!(
                "Statement {} in transaction is empty",
                index
            )));
        }
        if is_transaction_control(&statement.query) {
            return Err(RouterError::Validation(format!(
                "Statement {} in transaction is {}; the router issues BEGIN and COMMIT itself",
                index,
                command_tag(&statement.query)
            )));
        }
    }
    Ok(())
}

async fn run_batch(
    connection: &mut Connection,
    statements: &[BatchStatement],
    timeout: Duration,
) -> Result<Vec<QueryResult>> {
    // Applied outside the transaction so a rollback does not undo it.
    connection
        .set_statement_timeout(timeout)
        .await
        .map_err(|e| abort(None, e))?;
    connection.begin().await.map_err(|e| abort(None, e))?;

    let mut results = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
        match connection.execute(&statement.query, &statement.params).await {
            Ok(result) => results.push(result),
            Err(RouterError::Validation(message)) => {
                rollback(connection).await;
                return Err(RouterError::Validation(format!(
                    "Statement {}: {}",
                    index, message
                )));
            }
            Err(err) => {
                rollback(connection).await;
                return Err(abort(Some(index), err));
            }
        }
    }

    connection.commit().await.map_err(|e| abort(None, e))?;
    Ok(results)
}

async fn rollback(connection: &mut Connection) {
    if let Err(err) = connection.rollback().await {
        // The transaction state is unknown; keep the connection out of the pool.
        error!(connection = connection.id(), "rollback failed: {}", err);
        connection.close();
    }
}

fn abort(failed_statement: Option<usize>, err: RouterError) -> RouterError {
    let message = match err {
        RouterError::QueryExecution(message) => message,
        RouterError::TransactionAbort { message, .. } => message,
        other => other.to_string(),
    };
    RouterError::TransactionAbort {
        failed_statement,
        message,
    }
}
