//! Failsafe monitoring.
//!
//! The `FailsafeMonitor` watches for conditions under which autonomous
//! execution should stop: resource pressure, a high or unbroken run of
//! errors, tasks that loop, overrun or stall, and low confidence. It only
//! reports; acting on conditions is the supervisor's job.
//!
//! Resource usage is sampled by a background task on a fixed cadence and
//! cached, so [`FailsafeMonitor::check_all`] never waits on the probe.

use crate::clock::{self, Clock};
use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Upper bound on outcomes kept for the error-rate window.
const MAX_RESULTS: usize = 10_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Whether conditions at this level clear on their own.
    pub fn is_auto_recoverable(self) -> bool {
        self <= Severity::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConditionKind {
    CpuPressure,
    MemoryPressure,
    DiskPressure,
    ErrorRate,
    ConsecutiveErrors,
    IterationLimit { task: TaskId },
    WallClockLimit { task: TaskId },
    StuckTask { task: TaskId },
    LowConfidence,
}

impl ConditionKind {
    /// Raised by the recent outcome history rather than by live state.
    pub fn is_outcome_driven(&self) -> bool {
        matches!(self, ConditionKind::ErrorRate | ConditionKind::ConsecutiveErrors)
    }
}

/// A detected failsafe condition. Read-only snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub severity: Severity,
    pub threshold: f64,
    pub current_value: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Highest severity among `conditions`.
pub fn max_severity(conditions: &[Condition]) -> Option<Severity> {
    conditions.iter().map(|c| c.severity).max()
}

/// Resource usage in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// Source of resource usage samples, supplied by the environment.
///
/// `sample` may block; the monitor runs it on the blocking pool.
pub trait ResourceProbe: Send + Sync + std::fmt::Debug {
    fn sample(&self) -> ResourceUsage;
}

/// Probe returning a fixed, settable reading.
#[derive(Debug, Default)]
pub struct StaticProbe {
    usage: Mutex<ResourceUsage>,
}

impl StaticProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner()) = usage;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceUsage {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceThreshold {
    pub warning: f64,
    pub critical: f64,
}

impl Default for ResourceThreshold {
    fn default() -> Self {
        Self {
            warning: 95.0,
            critical: 99.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu: ResourceThreshold,
    pub memory: ResourceThreshold,
    pub disk: ResourceThreshold,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailsafeConfig {
    pub thresholds: ResourceThresholds,
    /// Failure fraction above which the error-rate condition fires.
    pub error_rate_threshold: f64,
    /// Outcomes older than this no longer count.
    pub error_window: Duration,
    /// Outcomes needed in the window before the error rate is judged.
    pub error_min_samples: usize,
    /// Unbroken failures that raise a condition. 0 disables the check.
    pub consecutive_error_threshold: u32,
    pub max_iterations: u32,
    pub task_wall_clock_limit: Duration,
    pub stuck_task_timeout: Duration,
    pub min_confidence: f64,
    pub probe_timeout: Duration,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            thresholds: ResourceThresholds::default(),
            error_rate_threshold: 0.5,
            error_window: Duration::from_secs(300),
            error_min_samples: 5,
            consecutive_error_threshold: 5,
            max_iterations: 20,
            task_wall_clock_limit: Duration::from_secs(3600),
            stuck_task_timeout: Duration::from_secs(600),
            min_confidence: 0.3,
            probe_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct TaskProgress {
    started_at: DateTime<Utc>,
    last_progress: DateTime<Utc>,
    iterations: u32,
}

#[derive(Debug, Default)]
struct State {
    /// Outcomes in arrival order.
    results: VecDeque<(DateTime<Utc>, bool)>,
    tasks: HashMap<TaskId, TaskProgress>,
    confidence: Option<f64>,
    usage: ResourceUsage,
}

#[derive(Debug)]
pub struct FailsafeMonitor {
    config: FailsafeConfig,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ResourceProbe>,
    state: Mutex<State>,
    latest: watch::Sender<Vec<Condition>>,
}

impl FailsafeMonitor {
    pub fn new(config: FailsafeConfig, clock: Arc<dyn Clock>, probe: Arc<dyn ResourceProbe>) -> Self {
        let (latest, _) = watch::channel(Vec::new());
        Self {
            config,
            clock,
            probe,
            state: Mutex::new(State::default()),
            latest,
        }
    }

    pub fn config(&self) -> &FailsafeConfig {
        &self.config
    }

    /// Evaluate every check against cached state and publish the result.
    ///
    /// Conditions are ordered by severity, highest first.
    pub fn check_all(&self) -> Vec<Condition> {
        let now = self.clock.now();
        let mut conditions = {
            let mut state = self.lock();
            prune(&mut state.results, now, self.config.error_window);
            let mut conditions = self.resource_conditions(&state.usage, now);
            conditions.extend(self.error_conditions(&state.results, now));
            conditions.extend(self.task_conditions(&state.tasks, now));
            conditions.extend(self.confidence_condition(state.confidence, now));
            conditions
        };
        conditions.sort_by(|a, b| b.severity.cmp(&a.severity));

        if !conditions.is_empty() {
            tracing::debug!(
                count = conditions.len(),
                severity = ?max_severity(&conditions),
                "failsafe conditions present"
            );
        }
        self.latest.send_replace(conditions.clone());
        conditions
    }

    /// Conditions from the most recent check.
    pub fn latest(&self) -> Vec<Condition> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Condition>> {
        self.latest.subscribe()
    }

    /// Last sampled resource usage.
    pub fn usage(&self) -> ResourceUsage {
        self.lock().usage
    }

    /// Record the outcome of one worker call.
    pub fn record_result(&self, success: bool) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.results.push_back((now, success));
        if state.results.len() > MAX_RESULTS {
            state.results.pop_front();
        }
        prune(&mut state.results, now, self.config.error_window);
    }

    /// Start tracking a task. Tracking an already tracked task is a no-op.
    pub fn track_task(&self, task: &TaskId) {
        let now = self.clock.now();
        self.lock()
            .tasks
            .entry(task.clone())
            .or_insert_with(|| TaskProgress {
                started_at: now,
                last_progress: now,
                iterations: 0,
            });
    }

    /// Count one more attempt at a task. Returns the new count.
    pub fn record_iteration(&self, task: &TaskId) -> u32 {
        let now = self.clock.now();
        let mut state = self.lock();
        let progress = state.tasks.entry(task.clone()).or_insert_with(|| TaskProgress {
            started_at: now,
            last_progress: now,
            iterations: 0,
        });
        progress.iterations += 1;
        progress.iterations
    }

    /// Note that a task is still moving.
    pub fn record_progress(&self, task: &TaskId) {
        let now = self.clock.now();
        if let Some(progress) = self.lock().tasks.get_mut(task) {
            progress.last_progress = now;
        }
    }

    /// Forget every recorded outcome.
    pub fn reset_outcomes(&self) {
        self.lock().results.clear();
    }

    pub fn untrack_task(&self, task: &TaskId) {
        self.lock().tasks.remove(task);
    }

    pub fn tracked_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn set_confidence(&self, confidence: f64) {
        self.lock().confidence = Some(confidence.clamp(0.0, 1.0));
    }

    pub fn clear_confidence(&self) {
        self.lock().confidence = None;
    }

    /// Judge a single confidence value without touching monitor state.
    pub fn assess_confidence(&self, confidence: f64) -> Option<Condition> {
        self.confidence_condition(Some(confidence.clamp(0.0, 1.0)), self.clock.now())
    }

    /// Sample the probe, bounded by `probe_timeout`, then re-check.
    ///
    /// A probe that fails or times out leaves the previous reading in place.
    pub async fn refresh(&self) -> Vec<Condition> {
        let probe = Arc::clone(&self.probe);
        let limit = self.config.probe_timeout;
        match tokio::time::timeout(limit, spawn_blocking(move || probe.sample())).await {
            Ok(Ok(usage)) => self.lock().usage = usage,
            Ok(Err(e)) => tracing::warn!(error = %e, "resource probe panicked"),
            Err(_) => tracing::warn!(timeout_ms = limit.as_millis() as u64, "resource probe timed out"),
        }
        self.check_all()
    }

    /// Refresh every `interval` until `cancel` fires.
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                }
            }
            tracing::debug!("failsafe sampler stopped");
        })
    }

    fn resource_conditions(&self, usage: &ResourceUsage, now: DateTime<Utc>) -> Vec<Condition> {
        let t = &self.config.thresholds;
        [
            (ConditionKind::CpuPressure, "cpu", usage.cpu, t.cpu),
            (ConditionKind::MemoryPressure, "memory", usage.memory, t.memory),
            (ConditionKind::DiskPressure, "disk", usage.disk, t.disk),
        ]
        .into_iter()
        .filter_map(|(kind, name, value, threshold)| {
            let (severity, limit) = if value >= threshold.critical {
                (Severity::Critical, threshold.critical)
            } else if value >= threshold.warning {
                (Severity::High, threshold.warning)
            } else {
                return None;
            };
            Some(Condition {
                kind,
                severity,
                threshold: limit,
                current_value: value,
                timestamp: now,
                message: format!("{} usage at {:.1}% (limit {:.1}%)", name, value, limit),
            })
        })
        .collect()
    }

    fn error_conditions(&self, results: &VecDeque<(DateTime<Utc>, bool)>, now: DateTime<Utc>) -> Vec<Condition> {
        let mut conditions = Vec::new();

        let total = results.len();
        if total > 0 && total >= self.config.error_min_samples {
            let failures = results.iter().filter(|(_, ok)| !ok).count();
            let rate = failures as f64 / total as f64;
            let threshold = self.config.error_rate_threshold;
            if rate > threshold {
                let severity = if rate >= (threshold * 2.0).min(1.0) {
                    Severity::High
                } else {
                    Severity::Medium
                };
                conditions.push(Condition {
                    kind: ConditionKind::ErrorRate,
                    severity,
                    threshold,
                    current_value: rate,
                    timestamp: now,
                    message: format!(
                        "{} of the last {} calls failed ({:.0}%)",
                        failures,
                        total,
                        rate * 100.0
                    ),
                });
            }
        }

        let limit = self.config.consecutive_error_threshold;
        let streak = results.iter().rev().take_while(|(_, ok)| !ok).count() as u32;
        if limit > 0 && streak >= limit {
            conditions.push(Condition {
                kind: ConditionKind::ConsecutiveErrors,
                severity: Severity::Medium,
                threshold: f64::from(limit),
                current_value: f64::from(streak),
                timestamp: now,
                message: format!("{} consecutive failed calls", streak),
            });
        }
        conditions
    }

    fn task_conditions(&self, tasks: &HashMap<TaskId, TaskProgress>, now: DateTime<Utc>) -> Vec<Condition> {
        let mut ids: Vec<&TaskId> = tasks.keys().collect();
        ids.sort();

        let mut conditions = Vec::new();
        for id in ids {
            let progress = &tasks[id];

            if self.config.max_iterations > 0 && progress.iterations >= self.config.max_iterations {
                conditions.push(Condition {
                    kind: ConditionKind::IterationLimit { task: id.clone() },
                    severity: Severity::High,
                    threshold: f64::from(self.config.max_iterations),
                    current_value: f64::from(progress.iterations),
                    timestamp: now,
                    message: format!("task {} reached {} iterations", id, progress.iterations),
                });
            }

            let running = clock::elapsed(progress.started_at, now);
            if running >= self.config.task_wall_clock_limit {
                conditions.push(Condition {
                    kind: ConditionKind::WallClockLimit { task: id.clone() },
                    severity: Severity::High,
                    threshold: self.config.task_wall_clock_limit.as_secs_f64(),
                    current_value: running.as_secs_f64(),
                    timestamp: now,
                    message: format!("task {} running for {}s", id, running.as_secs()),
                });
            }

            let idle = clock::elapsed(progress.last_progress, now);
            if idle >= self.config.stuck_task_timeout {
                conditions.push(Condition {
                    kind: ConditionKind::StuckTask { task: id.clone() },
                    severity: Severity::Medium,
                    threshold: self.config.stuck_task_timeout.as_secs_f64(),
                    current_value: idle.as_secs_f64(),
                    timestamp: now,
                    message: format!("task {} made no progress for {}s", id, idle.as_secs()),
                });
            }
        }
        conditions
    }

    fn confidence_condition(&self, confidence: Option<f64>, now: DateTime<Utc>) -> Option<Condition> {
        let value = confidence?;
        (value < self.config.min_confidence).then(|| Condition {
            kind: ConditionKind::LowConfidence,
            severity: Severity::Low,
            threshold: self.config.min_confidence,
            current_value: value,
            timestamp: now,
            message: format!("confidence {:.2} below {:.2}", value, self.config.min_confidence),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prune(results: &mut VecDeque<(DateTime<Utc>, bool)>, now: DateTime<Utc>, window: Duration) {
    while let Some((at, _)) = results.front() {
        if clock::elapsed(*at, now) > window {
            results.pop_front();
        } else {
            break;
        }
    }
}
