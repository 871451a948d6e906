use super::config::{KeyRule, RouterConfig};
use super::metrics::ShardMetrics;
use crate::connection::config::redact;
use crate::connection::pool::ConnectionPool;
use crate::core::{Result, RouterError};
use crate::driver::DriverFactory;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Sentinel for "no lag estimate yet".
const NO_LAG: u64 = u64::MAX;

/// A read-only copy of a shard's primary.
pub struct Replica {
    id: String,
    pool: ConnectionPool,
    healthy: AtomicBool,
    lag_ms: AtomicU64,
}

impl Replica {
    pub fn new(id: impl Into<String>, pool: ConnectionPool) -> Self {
        Self {
            id: id.into(),
            pool,
            healthy: AtomicBool::new(false),
            lag_ms: AtomicU64::new(NO_LAG),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Returns the previous flag.
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::SeqCst)
    }

    pub fn replication_lag(&self) -> Option<Duration> {
        match self.lag_ms.load(Ordering::SeqCst) {
            NO_LAG => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(crate) fn set_replication_lag(&self, lag: Option<Duration>) {
        let ms = lag.map_or(NO_LAG, |d| (d.as_millis() as u64).min(NO_LAG - 1));
        self.lag_ms.store(ms, Ordering::SeqCst);
    }
}

/// One horizontal partition: a primary pool, its replicas and their state.
pub struct Shard {
    id: String,
    name: String,
    key_rules: Vec<KeyRule>,
    primary: ConnectionPool,
    replicas: Vec<Replica>,
    healthy: AtomicBool,
    metrics: ShardMetrics,
}

impl Shard {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        key_rules: Vec<KeyRule>,
        primary: ConnectionPool,
        replicas: Vec<Replica>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            key_rules,
            primary,
            replicas,
            healthy: AtomicBool::new(false),
            metrics: ShardMetrics::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_rules(&self) -> &[KeyRule] {
        &self.key_rules
    }

    /// The only pool that accepts writes and transactions.
    pub fn primary(&self) -> &ConnectionPool {
        &self.primary
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Returns the previous flag.
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &ShardMetrics {
        &self.metrics
    }

    fn close(&self) {
        self.primary.close();
        for replica in &self.replicas {
            replica.pool.close();
        }
    }
}

/// Canonical, ordered list of shards.
pub struct ShardRegistry {
    shards: Vec<Arc<Shard>>,
    index: HashMap<String, usize>,
}

impl ShardRegistry {
    /// Build pools for every shard and replica and probe each endpoint once.
    ///
    /// Endpoints that fail the initial probe start unhealthy; startup only
    /// fails on configuration errors.
    pub async fn connect(config: &RouterConfig, drivers: &DriverFactory) -> Result<Self> {
        config.validate()?;

        let mut shards = Vec::with_capacity(config.shards.len());
        for shard_config in &config.shards {
            let primary = ConnectionPool::new(
                format!("{}/primary", shard_config.id),
                config.pool.to_pool_config(&shard_config.primary),
                drivers.driver_for(&shard_config.primary)?,
            )?;

            let replicas = shard_config
                .replicas
                .iter()
                .map(|replica| {
                    let pool = ConnectionPool::new(
                        format!("{}/{}", shard_config.id, replica.id),
                        config.pool.to_pool_config(&replica.url),
                        drivers.driver_for(&replica.url)?,
                    )?;
                    Ok(Replica::new(&replica.id, pool))
                })
                .collect::<Result<Vec<_>>>()?;

            shards.push(Shard::new(
                &shard_config.id,
                shard_config.display_name(),
                shard_config.key_rules.clone(),
                primary,
                replicas,
            ));
        }

        let registry = Self::new(shards)?;
        registry.probe_all(config.health.probe_timeout()).await;
        Ok(registry)
    }

    pub fn new(shards: Vec<Shard>) -> Result<Self> {
        let mut index = HashMap::with_capacity(shards.len());
        for (position, shard) in shards.iter().enumerate() {
            if index.insert(shard.id.clone(), position).is_some() {
                return Err(RouterError::Config(format!(
                    "Shard '{}' appears more than once",
                    shard.id
                )));
            }
        }

        Ok(Self {
            shards: shards.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    async fn probe_all(&self, timeout: Duration) {
        let primaries = self.shards.iter().map(|shard| async move {
            let outcome = shard.primary.probe(timeout).await;
            if let Err(err) = &outcome {
                warn!(
                    shard = %shard.id,
                    url = %redact(&shard.primary.config().url),
                    "initial probe failed, shard starts unhealthy: {}", err
                );
            } else if let Err(err) = shard.primary.warm_up().await {
                warn!(shard = %shard.id, "pool warm-up failed: {}", err);
            }
            shard.set_healthy(outcome.is_ok());
        });

        let replicas = self.shards.iter().flat_map(|shard| {
            shard.replicas.iter().map(move |replica| async move {
                let outcome = replica.pool.probe(timeout).await;
                if let Err(err) = &outcome {
                    warn!(
                        shard = %shard.id,
                        replica = %replica.id,
                        "initial probe failed, replica starts unhealthy: {}", err
                    );
                }
                replica.set_healthy(outcome.is_ok());
            })
        });

        futures::join!(join_all(primaries), join_all(replicas));

        let healthy = self.shards.iter().filter(|s| s.is_healthy()).count();
        info!(shards = self.shards.len(), healthy, "shard registry ready");
    }

    /// Look up a shard by id.
    pub fn get(&self, id: &str) -> Result<Arc<Shard>> {
        self.index
            .get(id)
            .map(|&position| Arc::clone(&self.shards[position]))
            .ok_or_else(|| RouterError::UnavailableShard(format!("Unknown shard '{}'", id)))
    }

    /// All shards in configuration order.
    pub fn all(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Close every pool. In-flight calls finish on their checked-out
    /// connections.
    pub fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
        info!(shards = self.shards.len(), "all shard pools closed");
    }
}
