use crate::shard::{Replica, Shard, ShardRegistry};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Periodic liveness prober for every primary and replica.
///
/// Only health flags and replica lag estimates are written here. Circuit
/// breakers are driven by request outcomes alone.
pub struct HealthMonitor {
    registry: Arc<ShardRegistry>,
    interval: Duration,
    probe_timeout: Duration,
}

/// Counts from one probing round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub healthy_shards: usize,
    pub unhealthy_shards: usize,
    pub healthy_replicas: usize,
    pub unhealthy_replicas: usize,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ShardRegistry>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            probe_timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run probing rounds every `interval` until `shutdown` becomes true or
    /// its sender is dropped.
    ///
    /// The first round runs one interval after spawning, since the registry
    /// probes every endpoint while connecting.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }

    /// Probe every endpoint once, concurrently, and update the flags.
    pub async fn check_all(&self) -> RoundSummary {
        let primaries = self.registry.all().iter().map(|shard| self.check_primary(shard));
        let replicas = self.registry.all().iter().flat_map(|shard| {
            shard
                .replicas()
                .iter()
                .map(move |replica| self.check_replica(shard, replica))
        });

        let (primaries, replicas) = futures::join!(join_all(primaries), join_all(replicas));

        let healthy_shards = primaries.iter().filter(|&&ok| ok).count();
        let healthy_replicas = replicas.iter().filter(|&&ok| ok).count();
        let summary = RoundSummary {
            healthy_shards,
            unhealthy_shards: primaries.len() - healthy_shards,
            healthy_replicas,
            unhealthy_replicas: replicas.len() - healthy_replicas,
        };
        debug!(?summary, "health round complete");
        summary
    }

    async fn check_primary(&self, shard: &Shard) -> bool {
        let outcome = shard.primary().probe(self.probe_timeout).await;
        let healthy = outcome.is_ok();
        let was_healthy = shard.set_healthy(healthy);

        match outcome {
            Err(err) if was_healthy => {
                warn!(shard = %shard.id(), "shard primary became unhealthy: {}", err)
            }
            Ok(()) if !was_healthy => info!(shard = %shard.id(), "shard primary recovered"),
            _ => {}
        }
        healthy
    }

    async fn check_replica(&self, shard: &Shard, replica: &Replica) -> bool {
        let outcome = replica.pool().probe(self.probe_timeout).await;
        let healthy = outcome.is_ok();
        let was_healthy = replica.set_healthy(healthy);

        match outcome {
            Err(err) if was_healthy => warn!(
                shard = %shard.id(),
                replica = %replica.id(),
                "replica became unhealthy: {}", err
            ),
            Ok(()) if !was_healthy => {
                info!(shard = %shard.id(), replica = %replica.id(), "replica recovered")
            }
            _ => {}
        }

        if healthy {
            match replica.pool().replication_lag(self.probe_timeout).await {
                Ok(lag) => replica.set_replication_lag(lag),
                Err(err) => debug!(
                    shard = %shard.id(),
                    replica = %replica.id(),
                    "replication lag unavailable: {}", err
                ),
            }
        }
        healthy
    }
}
