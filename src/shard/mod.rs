pub mod config;
pub mod metrics;
pub mod registry;

pub use config::{BreakerSettings, HealthSettings, KeyRule, PoolSettings, RouterConfig, ShardConfig};
pub use metrics::{MetricsSnapshot, ShardMetrics};
pub use registry::{Replica, Shard, ShardRegistry};
