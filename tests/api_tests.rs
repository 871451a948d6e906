/// HTTP API tests
///
/// Drives the axum router in-process with `tower::ServiceExt::oneshot`.
/// Run with: cargo test --test api_tests

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::Router;
use rustshard::{DriverFactory, KeyRule, MemoryCatalog, RouterConfig, ShardConfig, ShardRouter, api};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tower::ServiceExt;

async fn app() -> (Router, Arc<ShardRouter>, MemoryCatalog) {
    let drivers = DriverFactory::new();
    for db in ["users", "orders"] {
        let mut conn = drivers.memory_catalog().database(db).open_connection().unwrap();
        conn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
    }

    let config = RouterConfig::new(vec![
        ShardConfig::new("users", "memory://users").key_rule(KeyRule::contains("user")),
        ShardConfig::new("orders", "memory://orders"),
    ]);
    let router = Arc::new(ShardRouter::connect(config, &drivers).await.unwrap());
    (
        api::create_router(Arc::clone(&router)),
        router,
        drivers.memory_catalog().clone(),
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, JsonValue) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post(uri: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_query_round_trip() {
    let (app, _router, _catalog) = app().await;

    let (status, body) = send(
        &app,
        post(
            "/query",
            json!({
                "query": "INSERT INTO items VALUES ($1, $2)",
                "params": [1, "lamp"],
                "shardKey": "user_42",
                "operation": "write"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["shard"], "users");
    assert_eq!(body["rowCount"], 1);
    assert_eq!(body["circuitBreakerState"], "CLOSED");
    assert!(body["requestId"].is_string());

    let (status, body) = send(
        &app,
        post(
            "/query",
            json!({ "query": "SELECT id, name FROM items", "shardKey": "user_42" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows"], json!([{ "id": 1, "name": "lamp" }]));
    assert_eq!(body["command"], "SELECT");
    assert!(body["responseTimeMs"].is_u64());
}

#[tokio::test]
async fn test_validation_is_bad_request() {
    let (app, _router, _catalog) = app().await;

    let (status, body) = send(&app, post("/query", json!({ "shardKey": "user_1" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    let (status, body) = send(&app, post("/transaction", json!({ "queries": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    let (status, body) = send(
        &app,
        post("/query", json!({ "query": "BEGIN", "shard": "orders" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    let malformed = Request::builder()
        .method("POST")
        .uri("/query")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn test_unavailable_shard_is_service_unavailable() {
    let (app, _router, _catalog) = app().await;

    let (status, body) = send(&app, post("/query", json!({ "query": "SELECT 1" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "UnavailableShard");

    let (status, _) = send(
        &app,
        post("/query", json!({ "query": "SELECT 1", "shard": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_execution_failure_is_internal_error() {
    let (app, _router, _catalog) = app().await;

    let (status, body) = send(
        &app,
        post(
            "/query",
            json!({ "query": "SELECT * FROM nope", "shard": "orders" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "QueryExecutionError");
    assert!(body["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_transaction_endpoint() {
    let (app, _router, catalog) = app().await;

    let (status, body) = send(
        &app,
        post(
            "/transaction",
            json!({
                "shard": "orders",
                "queries": [
                    { "query": "INSERT INTO items VALUES (1, 'a')" },
                    { "query": "INSERT INTO items VALUES ($1, $2)", "params": [2, "b"] }
                ]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["queriesExecuted"], 2);
    assert_eq!(body["results"][1]["rowCount"], 1);

    let (status, body) = send(
        &app,
        post(
            "/transaction",
            json!({
                "shard": "orders",
                "queries": [
                    { "query": "INSERT INTO items VALUES (3, 'c')" },
                    { "query": "INSERT INTO items VALUES (1, 'dup')" }
                ]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "TransactionAbortError");
    assert_eq!(catalog.database("orders").row_count("items"), Some(2));
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let (app, router, catalog) = app().await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["shards"][0]["circuitBreakerState"], "CLOSED");

    send(
        &app,
        post("/query", json!({ "query": "SELECT 1", "shard": "orders" })),
    )
    .await;
    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["totalQueries"], 1);
    assert_eq!(body["shards"][1]["totalQueries"], 1);
    assert!(body["shards"][1]["avgResponseTime"].is_number());

    catalog.database("users").set_online(false);
    // Flags only change when the monitor runs.
    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    router.health_monitor().check_all().await;
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["shards"][0]["healthy"], false);
    assert_eq!(body["shards"][1]["healthy"], true);
}
