use crate::connection::pool::ConnectionPool;
use crate::shard::Shard;
use serde::{Deserialize, Serialize};

/// What a call intends to do with the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Transaction,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Transaction => "transaction",
        }
    }
}

/// Where a call was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Primary,
    Replica(&'a str),
}

/// Chooses the pool serving a call on a shard.
pub struct ReplicaSelector;

impl ReplicaSelector {
    /// Writes and transactions always get the primary. Reads rotate over
    /// healthy replicas by the shard's total query count and fall back to
    /// the primary when none is healthy.
    pub fn select(shard: &Shard, operation: Operation) -> (&ConnectionPool, Target<'_>) {
        if operation != Operation::Read {
            return (shard.primary(), Target::Primary);
        }

        let healthy: Vec<_> = shard.replicas().iter().filter(|r| r.is_healthy()).collect();
        if healthy.is_empty() {
            return (shard.primary(), Target::Primary);
        }

        let index = (shard.metrics().total_queries() % healthy.len() as u64) as usize;
        let replica = healthy[index];
        (replica.pool(), Target::Replica(replica.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::PoolConfig;
    use crate::driver::DriverFactory;
    use crate::shard::Replica;
    use std::time::Duration;

    fn pool(drivers: &DriverFactory, name: &str) -> ConnectionPool {
        let url = format!("memory://{}", name);
        ConnectionPool::new(name, PoolConfig::new(&url), drivers.driver_for(&url).unwrap()).unwrap()
    }

    fn shard_with_replicas(count: usize) -> Shard {
        let drivers = DriverFactory::new();
        let replicas = (0..count)
            .map(|i| {
                let replica = Replica::new(format!("r{}", i), pool(&drivers, &format!("r{}", i)));
                replica.set_healthy(true);
                replica
            })
            .collect();
        Shard::new("s", "s", Vec::new(), pool(&drivers, "primary"), replicas)
    }

    #[test]
    fn test_writes_and_transactions_use_primary() {
        let shard = shard_with_replicas(2);
        assert_eq!(ReplicaSelector::select(&shard, Operation::Write).1, Target::Primary);
        assert_eq!(
            ReplicaSelector::select(&shard, Operation::Transaction).1,
            Target::Primary
        );
    }

    #[test]
    fn test_reads_rotate_with_query_count() {
        let shard = shard_with_replicas(2);

        assert_eq!(ReplicaSelector::select(&shard, Operation::Read).1, Target::Replica("r0"));
        shard.metrics().record_success(Duration::from_millis(1));
        assert_eq!(ReplicaSelector::select(&shard, Operation::Read).1, Target::Replica("r1"));
        shard.metrics().record_success(Duration::from_millis(1));
        assert_eq!(ReplicaSelector::select(&shard, Operation::Read).1, Target::Replica("r0"));
    }

    #[test]
    fn test_unhealthy_replicas_are_skipped() {
        let shard = shard_with_replicas(3);
        shard.replicas()[0].set_healthy(false);

        for _ in 0..4 {
            let (_, target) = ReplicaSelector::select(&shard, Operation::Read);
            assert_ne!(target, Target::Replica("r0"));
            shard.metrics().record_success(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_reads_fall_back_to_primary() {
        let shard = shard_with_replicas(2);
        for replica in shard.replicas() {
            replica.set_healthy(false);
        }
        assert_eq!(ReplicaSelector::select(&shard, Operation::Read).1, Target::Primary);

        let no_replicas = shard_with_replicas(0);
        assert_eq!(
            ReplicaSelector::select(&no_replicas, Operation::Read).1,
            Target::Primary
        );
    }

    #[test]
    fn test_operation_wire_names() {
        let op: Operation = serde_json::from_str("\"read\"").unwrap();
        assert_eq!(op, Operation::Read);
        assert_eq!(Operation::Transaction.as_str(), "transaction");
    }
}
