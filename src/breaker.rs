//! Per-shard circuit breakers.
//!
//! A breaker starts `CLOSED` and counts consecutive failures. At the
//! threshold it opens and rejects calls until `cooldown` has passed since
//! the last failure. The first call after that becomes the single
//! `HALF_OPEN` probe: its success closes the breaker, its failure reopens
//! it. Other callers keep getting rejected while the probe is in flight.

use crate::core::{Result, RouterError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time since the last failure before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Reportable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    shard: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(shard: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            shard: shard.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    // Every transition completes under the lock, so a poisoned state is
    // still consistent.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            cooldown_ms: self.config.cooldown.as_millis() as u64,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Ask to make one call.
    ///
    /// Fails with `CircuitOpen` while the breaker is open and cooling down,
    /// or while another caller holds the half-open probe.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown);
                if !cooled_down {
                    return Err(self.rejection());
                }
                inner.state = CircuitState::HalfOpen;
                info!(shard = %self.shard, "circuit breaker half-open, admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.rejection());
                }
                true
            }
        };

        if probe {
            inner.probe_in_flight = true;
        }

        Ok(BreakerPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Run `operation` under the breaker, recording its outcome.
    pub async fn execute<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match operation.await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(err)
            }
        }
    }

    fn rejection(&self) -> RouterError {
        RouterError::CircuitOpen {
            shard: self.shard.clone(),
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();

        if probe {
            inner.probe_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                info!(shard = %self.shard, "circuit breaker closed");
            }
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        if probe {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Open;
            warn!(
                shard = %self.shard,
                failures = inner.failure_count,
                "half-open probe failed, circuit breaker reopened"
            );
        } else if inner.state == CircuitState::Closed
            && inner.failure_count >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            warn!(
                shard = %self.shard,
                failures = inner.failure_count,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
///
/// Settle it with `succeed` or `fail`. A permit given back with `release`,
/// or dropped unsettled, records nothing; a probe permit frees the probe
/// slot and leaves the breaker half-open.
#[must_use = "settle the permit with succeed(), fail() or release()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Give the permit back without an outcome, for calls rejected on the
    /// caller's account.
    pub fn release(self) {}
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// One breaker per shard, created on first use and kept for the life of
/// the router.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn get(&self, shard: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(shard.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(shard, self.config.clone()))),
        )
    }

    /// Existing breaker for `shard`, without creating one.
    pub fn peek(&self, shard: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shard)
            .cloned()
    }

    /// State for reporting; shards never called are `CLOSED`.
    pub fn state_of(&self, shard: &str) -> CircuitState {
        self.peek(shard).map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn snapshot_of(&self, shard: &str) -> BreakerSnapshot {
        match self.peek(shard) {
            Some(breaker) => breaker.snapshot(),
            None => BreakerSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                failure_threshold: self.config.failure_threshold,
                cooldown_ms: self.config.cooldown.as_millis() as u64,
                last_failure_at: None,
            },
        }
    }
}
