use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Per-shard query metrics, updated by the executors.
#[derive(Debug, Default)]
pub struct ShardMetrics {
    inner: Mutex<MetricsSnapshot>,
}

/// Point-in-time copy of [`ShardMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    /// Rolling average over successful statements, in milliseconds
    #[serde(rename = "avgResponseTime")]
    pub avg_response_ms: f64,
    pub error_count: u64,
    /// Calls refused by an open circuit breaker
    pub rejected_count: u64,
}

impl ShardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock still holds valid counters.
    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_queries(&self) -> u64 {
        self.lock().total_queries
    }

    /// Fold one successful statement into the rolling average.
    pub fn record_success(&self, elapsed: Duration) {
        self.record_batch(1, elapsed);
    }

    /// Fold `statements` successful statements that took `elapsed` in total.
    pub fn record_batch(&self, statements: u64, elapsed: Duration) {
        if statements == 0 {
            return;
        }

        let mut metrics = self.lock();
        let previous = metrics.total_queries as f64;
        let total = metrics.total_queries + statements;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        metrics.avg_response_ms = (metrics.avg_response_ms * previous + elapsed_ms) / total as f64;
        metrics.total_queries = total;
    }

    pub fn record_error(&self) {
        self.lock().error_count += 1;
    }

    pub fn record_rejected(&self) {
        self.lock().rejected_count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let metrics = ShardMetrics::new();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_success(Duration::from_millis(20));
        metrics.record_success(Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 3);
        assert!((snapshot.avg_response_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_batch_counts_every_statement() {
        let metrics = ShardMetrics::new();
        metrics.record_success(Duration::from_millis(40));
        metrics.record_batch(3, Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 4);
        // (40 * 1 + 20) / 4
        assert!((snapshot.avg_response_ms - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors_and_rejections_do_not_touch_average() {
        let metrics = ShardMetrics::new();
        metrics.record_success(Duration::from_millis(8));
        metrics.record_error();
        metrics.record_rejected();
        metrics.record_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.rejected_count, 2);
        assert!((snapshot.avg_response_ms - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(ShardMetrics::new().snapshot()).unwrap();
        assert!(json.get("totalQueries").is_some());
        assert!(json.get("avgResponseTime").is_some());
        assert!(json.get("errorCount").is_some());
    }
}
