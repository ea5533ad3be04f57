//! Per-worker circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open →
//! HalfOpen once the current timeout has elapsed. HalfOpen admits a single
//! trial call: success closes the breaker and restores the base timeout,
//! failure reopens it with the timeout multiplied by `backoff_factor`
//! (capped at `max_timeout`).

use crate::clock::{self, Clock};
use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Base open duration before a trial call is allowed.
    pub timeout: Duration,
    pub backoff_factor: f64,
    pub max_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_timeout: Duration::from_secs(300),
        }
    }
}

/// Call statistics, kept across state changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    /// Calls admitted and invoked.
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls rejected without invoking the closure.
    pub rejections: u64,
    pub total_latency: Duration,
    pub last_failure: Option<DateTime<Utc>>,
}

impl BreakerStats {
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.successes + self.failures;
        if finished == 0 {
            None
        } else {
            Some(self.successes as f64 / finished as f64)
        }
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        let finished = self.successes + self.failures;
        if finished == 0 {
            return None;
        }
        u32::try_from(finished)
            .ok()
            .map(|n| self.total_latency / n)
    }
}

/// Read-only view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub current_timeout: Duration,
    pub stats: BreakerStats,
}

#[derive(Debug, Error, PartialEq)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    current_timeout: Duration,
    trial_in_flight: bool,
    stats: BreakerStats,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Inner {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            current_timeout: config.timeout,
            trial_in_flight: false,
            stats: BreakerStats::default(),
        };
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving Open → HalfOpen if the timeout has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            opened_at: inner.opened_at,
            current_timeout: inner.current_timeout,
            stats: inner.stats.clone(),
        }
    }

    /// Force the breaker closed, clearing failures and backoff.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.current_timeout = self.config.timeout;
        inner.trial_in_flight = false;
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls return `BreakerError::Open` without invoking `f`.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(trial) = self.admit() else {
            return Err(BreakerError::Open);
        };
        let guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let started = tokio::time::Instant::now();
        let result = f().await;
        let latency = started.elapsed();
        guard.disarm();

        match result {
            Ok(value) => {
                self.on_success(trial, latency);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(trial, latency);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Decide whether a call may proceed. `Some(true)` marks the HalfOpen
    /// trial, `None` a rejection.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let state = inner.state;
        match state {
            BreakerState::Closed => {
                inner.stats.calls += 1;
                Some(false)
            }
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                inner.stats.calls += 1;
                tracing::debug!(breaker = %self.name, "admitting half-open trial call");
                Some(true)
            }
            BreakerState::Open | BreakerState::HalfOpen => {
                inner.stats.rejections += 1;
                None
            }
        }
    }

    fn on_success(&self, trial: bool, latency: Duration) {
        let mut inner = self.lock();
        inner.stats.successes += 1;
        inner.stats.total_latency += latency;
        inner.consecutive_failures = 0;
        if trial && inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.current_timeout = self.config.timeout;
            inner.trial_in_flight = false;
            tracing::info!(breaker = %self.name, "circuit closed after successful trial");
        }
    }

    fn on_failure(&self, trial: bool, latency: Duration) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.stats.failures += 1;
        inner.stats.total_latency += latency;
        inner.stats.last_failure = Some(now);
        inner.consecutive_failures += 1;

        let state = inner.state;
        let failures = inner.consecutive_failures;
        match state {
            BreakerState::HalfOpen if trial => {
                inner.current_timeout = self.backoff(inner.current_timeout);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                tracing::warn!(
                    breaker = %self.name,
                    timeout_ms = inner.current_timeout.as_millis() as u64,
                    "trial call failed, circuit reopened"
                );
            }
            BreakerState::Closed if failures >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    timeout_ms = inner.current_timeout.as_millis() as u64,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    fn backoff(&self, current: Duration) -> Duration {
        let factor = self.config.backoff_factor.max(1.0);
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .unwrap_or(self.config.max_timeout)
            .min(self.config.max_timeout)
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if self.clock.now() >= clock::add(opened_at, inner.current_timeout) {
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
            tracing::info!(breaker = %self.name, "circuit half-open");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the HalfOpen trial slot if the call is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// One breaker per worker, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<WorkerId, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, worker: &WorkerId) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(breakers.entry(worker.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                worker.as_str(),
                self.config.clone(),
                Arc::clone(&self.clock),
            ))
        }))
    }

    /// State of an existing breaker; workers never called have none.
    pub fn state(&self, worker: &WorkerId) -> Option<BreakerState> {
        let breaker = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .cloned()?;
        Some(breaker.state())
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
