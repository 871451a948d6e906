/// Circuit breaker tests
///
/// Breaker behaviour observed through the router: opening at the threshold,
/// rejecting without touching the database, the single half-open probe and
/// failures shared across concurrent callers.
/// Run with: cargo test --test circuit_breaker_tests

use futures::future::join_all;
use rustshard::{
    CircuitState, DriverFactory, MemoryDatabase, Operation, QueryRequest, RouterConfig,
    RouterError, ShardConfig, ShardRouter,
};
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (Arc<ShardRouter>, MemoryDatabase) {
    let drivers = DriverFactory::new();
    let db = drivers.memory_catalog().database("payments");
    let mut conn = db.open_connection().unwrap();
    conn.execute("CREATE TABLE charges (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    let config = RouterConfig::new(vec![ShardConfig::new("payments", "memory://payments")]);
    let router = ShardRouter::connect(config, &drivers).await.unwrap();
    (Arc::new(router), db)
}

fn failing() -> QueryRequest {
    QueryRequest::new("SELECT * FROM missing_table")
        .shard("payments")
        .operation(Operation::Write)
}

fn succeeding() -> QueryRequest {
    QueryRequest::new("SELECT COUNT(*) FROM charges")
        .shard("payments")
        .operation(Operation::Write)
}

#[tokio::test(start_paused = true)]
async fn test_opens_after_threshold_and_rejects_without_io() {
    let (router, db) = setup().await;

    for _ in 0..5 {
        let err = router.execute_query(failing()).await.unwrap_err();
        assert!(matches!(err, RouterError::QueryExecution(_)));
    }
    assert_eq!(router.breakers().state_of("payments"), CircuitState::Open);

    let statements = db.statements_executed();
    let connections = db.connections_opened();

    let err = router.execute_query(succeeding()).await.unwrap_err();
    assert!(matches!(err, RouterError::CircuitOpen { ref shard } if shard == "payments"));
    assert_eq!(err.kind(), "CircuitOpenError");

    assert_eq!(db.statements_executed(), statements);
    assert_eq!(db.connections_opened(), connections);

    let metrics = router.metrics();
    assert_eq!(metrics.shards[0].metrics.error_count, 5);
    assert_eq!(metrics.shards[0].metrics.rejected_count, 1);
    assert_eq!(metrics.summary.open_circuit_breakers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_count_while_closed() {
    let (router, _db) = setup().await;

    for _ in 0..4 {
        router.execute_query(failing()).await.unwrap_err();
    }
    router.execute_query(succeeding()).await.unwrap();
    assert_eq!(router.breakers().get("payments").failure_count(), 0);

    for _ in 0..4 {
        router.execute_query(failing()).await.unwrap_err();
    }
    assert_eq!(router.breakers().state_of("payments"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_successful_probe_closes_breaker() {
    let (router, _db) = setup().await;
    for _ in 0..5 {
        router.execute_query(failing()).await.unwrap_err();
    }

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(matches!(
        router.execute_query(succeeding()).await,
        Err(RouterError::CircuitOpen { .. })
    ));

    tokio::time::advance(Duration::from_secs(2)).await;
    let response = router.execute_query(succeeding()).await.unwrap();
    assert_eq!(response.circuit_breaker_state, CircuitState::Closed);

    let snapshot = router.breakers().snapshot_of("payments");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_and_restarts_cooldown() {
    let (router, _db) = setup().await;
    for _ in 0..5 {
        router.execute_query(failing()).await.unwrap_err();
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(matches!(
        router.execute_query(failing()).await,
        Err(RouterError::QueryExecution(_))
    ));
    assert_eq!(router.breakers().state_of("payments"), CircuitState::Open);

    // Cooldown counts from the probe's failure.
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(matches!(
        router.execute_query(succeeding()).await,
        Err(RouterError::CircuitOpen { .. })
    ));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(router.execute_query(succeeding()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_only_one_probe_in_half_open() {
    let (router, db) = setup().await;
    for _ in 0..5 {
        router.execute_query(failing()).await.unwrap_err();
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    db.set_latency(Duration::from_secs(1));
    let probe = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.execute_query(succeeding()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(router.breakers().state_of("payments"), CircuitState::HalfOpen);

    let others = join_all((0..3).map(|_| router.execute_query(succeeding()))).await;
    for outcome in others {
        assert!(matches!(outcome, Err(RouterError::CircuitOpen { .. })));
    }

    assert!(probe.await.unwrap().is_ok());
    assert_eq!(router.breakers().state_of("payments"), CircuitState::Closed);
}

#[tokio::test]
async fn test_concurrent_failures_share_one_counter() {
    let (router, _db) = setup().await;

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.execute_query(failing()).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }

    assert_eq!(router.breakers().state_of("payments"), CircuitState::Open);
    assert!(matches!(
        router.execute_query(succeeding()).await,
        Err(RouterError::CircuitOpen { .. })
    ));
}

#[tokio::test]
async fn test_validation_errors_do_not_count() {
    let (router, _db) = setup().await;

    for _ in 0..10 {
        let err = router
            .execute_query(QueryRequest::new("  ").shard("payments"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }
    assert_eq!(router.breakers().state_of("payments"), CircuitState::Closed);
}

#[tokio::test]
async fn test_health_probe_never_touches_breaker() {
    let (router, _db) = setup().await;
    for _ in 0..5 {
        router.execute_query(failing()).await.unwrap_err();
    }

    // Healthy by probe while the breaker is open.
    router.health_monitor().check_all().await;
    let health = router.health();
    assert!(health.shards[0].healthy);
    assert_eq!(health.shards[0].circuit_breaker_state, CircuitState::Open);

    // Unhealthy by probe leaves a closed breaker closed.
    let (other, other_db) = setup().await;
    other_db.set_online(false);
    other.health_monitor().check_all().await;
    let health = other.health();
    assert!(!health.shards[0].healthy);
    assert_eq!(health.shards[0].circuit_breaker_state, CircuitState::Closed);
    assert_eq!(other.breakers().get("payments").failure_count(), 0);
}
