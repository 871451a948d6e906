// ============================================================================
// RustShard Library
// ============================================================================
//
// Routes queries and transactions across horizontally partitioned
// databases: key-based shard resolution, replica read splitting, per-shard
// circuit breaking and single-shard atomic transactions.
//
// ============================================================================

pub mod api;
pub mod breaker;
pub mod connection;
pub mod core;
pub mod driver;
pub mod executor;
pub mod health;
pub mod result;
pub mod router;
pub mod routing;
pub mod shard;

// Re-export main types for convenience
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use crate::core::{Result, RouterError, Value};
pub use driver::DriverFactory;
pub use driver::memory::{MemoryCatalog, MemoryDatabase};
pub use executor::{BatchStatement, QueryExecutor, TransactionExecutor};
pub use health::HealthMonitor;
pub use result::QueryResult;
pub use router::{
    HealthReport, HealthStatus, MetricsReport, QueryRequest, QueryResponse, ShardRouter,
    TransactionRequest, TransactionResponse,
};
pub use routing::{KeyRouter, Operation};
pub use shard::{KeyRule, RouterConfig, ShardConfig, ShardRegistry};

// Re-export connection API
pub use connection::{
    Connection, Driver, DriverConnection,
    config::PoolConfig,
    pool::{ConnectionPool, PoolGuard, PoolStats},
};
