//! HTTP surface of the router
//!
//! `POST /query`, `POST /transaction`, `GET /health` and `GET /metrics`,
//! all sharing one [`ShardRouter`].

pub mod error;

pub use error::{ApiError, ErrorResponse};

use crate::router::{
    HealthReport, MetricsReport, QueryRequest, QueryResponse, ShardRouter, TransactionRequest,
    TransactionResponse,
};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(router: Arc<ShardRouter>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(query))
        .route("/transaction", post(transaction))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(router)
}

async fn query(
    State(router): State<Arc<ShardRouter>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> error::Result<Json<QueryResponse>> {
    let Json(request) = payload?;
    Ok(Json(router.execute_query(request).await?))
}

async fn transaction(
    State(router): State<Arc<ShardRouter>>,
    payload: Result<Json<TransactionRequest>, JsonRejection>,
) -> error::Result<Json<TransactionResponse>> {
    let Json(request) = payload?;
    Ok(Json(router.execute_transaction(request).await?))
}

async fn health(State(router): State<Arc<ShardRouter>>) -> (StatusCode, Json<HealthReport>) {
    let report = router.health();
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics(State(router): State<Arc<ShardRouter>>) -> Json<MetricsReport> {
    Json(router.metrics())
}
