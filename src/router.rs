// ============================================================================
// Shard Router
// ============================================================================
//
// The one object a process builds at startup and hands to every request
// handler. Owns the registry, key router, breakers and executors, and
// defines the request/response shapes of the external interface.
//
// ============================================================================

use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitState};
use crate::core::{Result, RouterError, Value};
use crate::driver::DriverFactory;
use crate::executor::{BatchStatement, QueryExecutor, TransactionExecutor};
use crate::health::HealthMonitor;
use crate::result::StatementResult;
use crate::routing::{KeyRouter, Operation};
use crate::shard::{MetricsSnapshot, RouterConfig, Shard, ShardRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

// ============================================================================
// Requests and responses
// ============================================================================

fn default_operation() -> Operation {
    Operation::Read
}

/// Single-statement request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub shard_key: Option<String>,
    /// Explicit shard id; skips key resolution
    pub shard: Option<String>,
    #[serde(default = "default_operation")]
    pub operation: Operation,
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
            shard_key: None,
            shard: None,
            operation: Operation::Read,
            timeout_ms: None,
        }
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn shard_key(mut self, key: impl Into<String>) -> Self {
        self.shard_key = Some(key.into());
        self
    }

    pub fn shard(mut self, id: impl Into<String>) -> Self {
        self.shard = Some(id.into());
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(RouterError::Validation("Query must not be empty".into()));
        }
        validate_timeout(self.timeout_ms)
    }
}

/// Multi-statement request executed atomically on one shard.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(default)]
    pub queries: Vec<BatchStatement>,
    pub shard_key: Option<String>,
    pub shard: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl TransactionRequest {
    pub fn new(queries: Vec<BatchStatement>) -> Self {
        Self {
            queries,
            shard_key: None,
            shard: None,
            timeout_ms: None,
        }
    }

    pub fn shard_key(mut self, key: impl Into<String>) -> Self {
        self.shard_key = Some(key.into());
        self
    }

    pub fn shard(mut self, id: impl Into<String>) -> Self {
        self.shard = Some(id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            return Err(RouterError::Validation(
                "Transaction must contain at least one statement".into(),
            ));
        }
        validate_timeout(self.timeout_ms)
    }
}

fn validate_timeout(timeout_ms: Option<u64>) -> Result<()> {
    match timeout_ms {
        Some(0) => Err(RouterError::Validation("timeoutMs must be greater than 0".into())),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub request_id: Uuid,
    pub rows: Vec<JsonMap<String, JsonValue>>,
    pub row_count: u64,
    pub command: String,
    pub shard: String,
    /// `primary` or the id of the replica that served the read
    pub target: String,
    pub operation: Operation,
    pub response_time_ms: u64,
    pub circuit_breaker_state: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub request_id: Uuid,
    pub results: Vec<StatementResult>,
    pub shard: String,
    pub response_time_ms: u64,
    pub queries_executed: usize,
    pub circuit_breaker_state: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub shards: Vec<ShardHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardHealth {
    pub id: String,
    pub name: String,
    pub healthy: bool,
    pub circuit_breaker_state: CircuitState,
    pub replicas: Vec<ReplicaHealth>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaHealth {
    pub id: String,
    pub healthy: bool,
    pub replication_lag_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub shards: Vec<ShardMetricsReport>,
    pub summary: MetricsSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMetricsReport {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub is_healthy: bool,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub circuit_breaker: BreakerSnapshot,
    pub replicas: Vec<ReplicaHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_shards: usize,
    pub healthy_shards: usize,
    pub total_queries: u64,
    pub total_errors: u64,
    pub total_rejected: u64,
    /// Query-weighted across shards, in milliseconds
    pub avg_response_time: f64,
    pub open_circuit_breakers: usize,
}

impl MetricsSummary {
    fn from_shards(shards: &[ShardMetricsReport]) -> Self {
        let mut summary = Self {
            total_shards: shards.len(),
            ..Self::default()
        };
        let mut weighted_ms = 0.0;

        for shard in shards {
            summary.total_queries += shard.metrics.total_queries;
            summary.total_errors += shard.metrics.error_count;
            summary.total_rejected += shard.metrics.rejected_count;
            weighted_ms += shard.metrics.avg_response_ms * shard.metrics.total_queries as f64;
            if shard.is_healthy {
                summary.healthy_shards += 1;
            }
            if shard.circuit_breaker.state != CircuitState::Closed {
                summary.open_circuit_breakers += 1;
            }
        }

        if summary.total_queries > 0 {
            summary.avg_response_time = weighted_ms / summary.total_queries as f64;
        }
        summary
    }
}

fn millis(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}

fn replica_health(shard: &Shard) -> Vec<ReplicaHealth> {
    shard
        .replicas()
        .iter()
        .map(|replica| ReplicaHealth {
            id: replica.id().to_string(),
            healthy: replica.is_healthy(),
            replication_lag_ms: replica.replication_lag().map(millis),
        })
        .collect()
}

// ============================================================================
// Router
// ============================================================================

pub struct ShardRouter {
    config: RouterConfig,
    registry: Arc<ShardRegistry>,
    key_router: KeyRouter,
    breakers: Arc<BreakerRegistry>,
    queries: QueryExecutor,
    transactions: TransactionExecutor,
    health: Arc<HealthMonitor>,
}

impl ShardRouter {
    /// Validate `config`, open and probe every pool, and wire the
    /// components together.
    pub async fn connect(config: RouterConfig, drivers: &DriverFactory) -> Result<Self> {
        let registry = Arc::new(ShardRegistry::connect(&config, drivers).await?);
        let key_router = KeyRouter::from_registry(&registry, config.default_shard.as_deref())?;

        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from(&config.breaker)));
        let statement_timeout = config.default_statement_timeout();
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            config.health.interval(),
            config.health.probe_timeout(),
        ));

        info!(
            shards = registry.all().len(),
            default_shard = config.default_shard.as_deref().unwrap_or("-"),
            "shard router connected"
        );

        Ok(Self {
            queries: QueryExecutor::new(Arc::clone(&breakers), statement_timeout),
            transactions: TransactionExecutor::new(Arc::clone(&breakers), statement_timeout),
            config,
            registry,
            key_router,
            breakers,
            health,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    /// Shard id a key resolves to.
    pub fn resolve(&self, shard_key: Option<&str>) -> Result<&str> {
        self.key_router.resolve(shard_key)
    }

    fn target_shard(&self, shard: Option<&str>, shard_key: Option<&str>) -> Result<Arc<Shard>> {
        let id = match shard {
            Some(id) => id,
            None => self.key_router.resolve(shard_key)?,
        };
        debug!(shard = %id, key = shard_key.unwrap_or(""), "resolved shard");
        self.registry.get(id)
    }

    pub async fn execute_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        request.validate()?;
        let shard = self.target_shard(request.shard.as_deref(), request.shard_key.as_deref())?;

        let outcome = self
            .queries
            .execute(
                &shard,
                &request.query,
                &request.params,
                request.operation,
                request.timeout_ms.map(Duration::from_millis),
            )
            .await?;

        Ok(QueryResponse {
            request_id: Uuid::new_v4(),
            rows: outcome.result.rows_as_objects(),
            row_count: outcome.result.row_count,
            command: outcome.result.command,
            shard: outcome.shard,
            target: outcome.target,
            operation: outcome.operation,
            response_time_ms: millis(outcome.elapsed),
            circuit_breaker_state: outcome.breaker_state,
        })
    }

    pub async fn execute_transaction(&self, request: TransactionRequest) -> Result<TransactionResponse> {
        request.validate()?;
        let shard = self.target_shard(request.shard.as_deref(), request.shard_key.as_deref())?;

        let outcome = self
            .transactions
            .execute(
                &shard,
                &request.queries,
                request.timeout_ms.map(Duration::from_millis),
            )
            .await?;

        Ok(TransactionResponse {
            request_id: Uuid::new_v4(),
            queries_executed: outcome.statements_executed(),
            results: outcome.results.iter().map(|r| r.to_statement_result()).collect(),
            shard: outcome.shard,
            response_time_ms: millis(outcome.elapsed),
            circuit_breaker_state: outcome.breaker_state,
        })
    }

    /// Health flags as last set by probing, plus breaker states.
    pub fn health(&self) -> HealthReport {
        let shards: Vec<ShardHealth> = self
            .registry
            .all()
            .iter()
            .map(|shard| ShardHealth {
                id: shard.id().to_string(),
                name: shard.name().to_string(),
                healthy: shard.is_healthy(),
                circuit_breaker_state: self.breakers.state_of(shard.id()),
                replicas: replica_health(shard),
            })
            .collect();

        let status = if shards.iter().all(|s| s.healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            shards,
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        let shards: Vec<ShardMetricsReport> = self
            .registry
            .all()
            .iter()
            .map(|shard| {
                let pool = shard.primary().stats();
                ShardMetricsReport {
                    id: shard.id().to_string(),
                    name: shard.name().to_string(),
                    metrics: shard.metrics().snapshot(),
                    is_healthy: shard.is_healthy(),
                    active_connections: pool.active_connections,
                    idle_connections: pool.available_connections,
                    circuit_breaker: self.breakers.snapshot_of(shard.id()),
                    replicas: replica_health(shard),
                }
            })
            .collect();

        MetricsReport {
            timestamp: Utc::now(),
            summary: MetricsSummary::from_shards(&shards),
            shards,
        }
    }

    /// Close every pool. Calls already holding a connection finish.
    pub fn shutdown(&self) {
        self.registry.close();
        info!("shard router shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{KeyRule, ShardConfig};

    async fn router() -> (ShardRouter, DriverFactory) {
        let drivers = DriverFactory::new();
        let config = RouterConfig::new(vec![
            ShardConfig::new("users", "memory://rt-users").key_rule(KeyRule::contains("user")),
            ShardConfig::new("orders", "memory://rt-orders").replica("orders-r1", "memory://rt-orders-r1"),
            ShardConfig::new("misc", "memory://rt-misc"),
        ])
        .default_shard("misc");

        for db in ["rt-users", "rt-orders", "rt-orders-r1", "rt-misc"] {
            let mut conn = drivers.memory_catalog().database(db).open_connection().unwrap();
            conn.execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)", &[])
                .await
                .unwrap();
        }

        (ShardRouter::connect(config, &drivers).await.unwrap(), drivers)
    }

    #[tokio::test]
    async fn test_query_routes_by_key_rule() {
        let (router, drivers) = router().await;

        let response = router
            .execute_query(
                QueryRequest::new("INSERT INTO kv VALUES ($1, $2)")
                    .params(vec!["user_42".into(), Value::Integer(1)])
                    .shard_key("user_42")
                    .operation(Operation::Write),
            )
            .await
            .unwrap();

        assert_eq!(response.shard, "users");
        assert_eq!(response.command, "INSERT");
        assert_eq!(response.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(drivers.memory_catalog().database("rt-users").row_count("kv"), Some(1));
    }

    #[tokio::test]
    async fn test_unkeyed_request_uses_default_shard() {
        let (router, _drivers) = router().await;

        let response = router.execute_query(QueryRequest::new("SELECT 1")).await.unwrap();
        assert_eq!(response.shard, "misc");
    }

    #[tokio::test]
    async fn test_explicit_shard_bypasses_key() {
        let (router, _drivers) = router().await;

        let response = router
            .execute_query(QueryRequest::new("SELECT * FROM kv").shard("orders").shard_key("user_1"))
            .await
            .unwrap();
        assert_eq!(response.shard, "orders");
        assert_eq!(response.target, "orders-r1");

        assert!(matches!(
            router.execute_query(QueryRequest::new("SELECT 1").shard("nope")).await,
            Err(RouterError::UnavailableShard(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_comes_before_routing() {
        let (router, _drivers) = router().await;

        assert!(matches!(
            router.execute_query(QueryRequest::new("").shard("nope")).await,
            Err(RouterError::Validation(_))
        ));
        assert!(matches!(
            router
                .execute_query(QueryRequest::new("SELECT 1").timeout(Duration::ZERO))
                .await,
            Err(RouterError::Validation(_))
        ));
        assert!(matches!(
            router.execute_transaction(TransactionRequest::new(vec![])).await,
            Err(RouterError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_response_shape() {
        let (router, _drivers) = router().await;

        let response = router
            .execute_transaction(
                TransactionRequest::new(vec![
                    BatchStatement::new("INSERT INTO kv VALUES ('a', 1)", vec![]),
                    BatchStatement::new("SELECT k, v FROM kv", vec![]),
                ])
                .shard("orders"),
            )
            .await
            .unwrap();

        assert_eq!(response.queries_executed, 2);
        assert_eq!(response.results[1].rows[0]["k"], JsonValue::from("a"));

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("requestId").is_some());
        assert_eq!(json["circuitBreakerState"], "CLOSED");
    }

    #[tokio::test]
    async fn test_health_and_metrics_reports() {
        let (router, drivers) = router().await;
        router
            .execute_query(QueryRequest::new("SELECT 1").shard("users"))
            .await
            .unwrap();

        assert!(router.health().is_healthy());
        drivers.memory_catalog().database("rt-misc").set_online(false);
        router.health_monitor().check_all().await;

        let health = router.health();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.shards[2].healthy);

        let metrics = router.metrics();
        assert_eq!(metrics.summary.total_shards, 3);
        assert_eq!(metrics.summary.healthy_shards, 2);
        assert_eq!(metrics.summary.total_queries, 1);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["shards"][0]["totalQueries"], 1);
        assert_eq!(json["shards"][0]["circuitBreaker"]["state"], "CLOSED");
    }
}
