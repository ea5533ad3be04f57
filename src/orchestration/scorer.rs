//! Task scoring.
//!
//! A task's score is a weighted sum of six sub-scores, each in `[0, 1]`:
//! priority, complexity, domain freshness, worker availability, time of
//! day and user preference. With weights summing to 1.0 the score is
//! itself in `[0, 1]`.

use crate::core::context::ExecutionContext;
use crate::core::task::Task;
use crate::core::worker::{Worker, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Relative weight of each sub-score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub priority: f64,
    pub complexity: f64,
    pub domain_freshness: f64,
    pub worker_availability: f64,
    pub time_of_day: f64,
    pub user_preference: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority: 0.35,
            complexity: 0.15,
            domain_freshness: 0.20,
            worker_availability: 0.15,
            time_of_day: 0.10,
            user_preference: 0.05,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.priority
            + self.complexity
            + self.domain_freshness
            + self.worker_availability
            + self.time_of_day
            + self.user_preference
    }

    /// Reject negative weights or weights that do not sum to 1.0.
    pub fn validate(&self) -> Result<()> {
        let all = [
            self.priority,
            self.complexity,
            self.domain_freshness,
            self.worker_availability,
            self.time_of_day,
            self.user_preference,
        ];
        let sum = self.sum();
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) || (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::InvalidWeights { sum });
        }
        Ok(())
    }
}

/// Thresholds and fallback values used by the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Domain failure rate above which tasks in that domain are avoided.
    pub avoid_failure_rate: f64,
    /// Consecutive domain failures at which tasks in that domain are avoided.
    pub avoid_consecutive_failures: u32,
    /// Availability sub-score when workers are online but none can take the task.
    pub unmatched_domain_score: f64,
    /// Time-of-day sub-score outside every preferred window.
    pub off_window_score: f64,
    /// Preference sub-score for tasks the user expressed nothing about.
    pub neutral_preference: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            avoid_failure_rate: 0.7,
            avoid_consecutive_failures: 3,
            unmatched_domain_score: 0.3,
            off_window_score: 0.5,
            neutral_preference: 0.5,
        }
    }
}

/// Why a task should be deferred in favor of safer work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AvoidReason {
    HighFailureRate { domain: String, rate: f64 },
    ConsecutiveFailures { domain: String, count: u32 },
    PinnedWorkerUnavailable { worker: WorkerId },
}

impl std::fmt::Display for AvoidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvoidReason::HighFailureRate { domain, rate } => {
                write!(f, "domain {} failing at {:.0}%", domain, rate * 100.0)
            }
            AvoidReason::ConsecutiveFailures { domain, count } => {
                write!(f, "domain {} failed {} times in a row", domain, count)
            }
            AvoidReason::PinnedWorkerUnavailable { worker } => {
                write!(f, "pinned worker {} unavailable", worker)
            }
        }
    }
}

/// The six sub-scores behind a task's score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub priority: f64,
    pub complexity: f64,
    pub domain_freshness: f64,
    pub worker_availability: f64,
    pub time_of_day: f64,
    pub user_preference: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct TaskScorer {
    weights: ScoringWeights,
    config: ScorerConfig,
}

impl TaskScorer {
    /// # Errors
    /// `InvalidWeights` unless the weights are non-negative and sum to 1.0.
    pub fn new(weights: ScoringWeights, config: ScorerConfig) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights, config })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn score(&self, task: &Task, ctx: &ExecutionContext, workers: &[Worker]) -> f64 {
        self.breakdown(task, ctx, workers).total
    }

    pub fn breakdown(&self, task: &Task, ctx: &ExecutionContext, workers: &[Worker]) -> ScoreBreakdown {
        let w = &self.weights;
        let mut b = ScoreBreakdown {
            priority: task.priority.normalized(),
            complexity: task.complexity.preference(),
            domain_freshness: self.domain_freshness(task, ctx),
            worker_availability: self.worker_availability(task, workers),
            time_of_day: self.time_of_day(ctx),
            user_preference: self.user_preference(task, ctx),
            total: 0.0,
        };
        b.total = (w.priority * b.priority
            + w.complexity * b.complexity
            + w.domain_freshness * b.domain_freshness
            + w.worker_availability * b.worker_availability
            + w.time_of_day * b.time_of_day
            + w.user_preference * b.user_preference)
            .clamp(0.0, 1.0);
        b
    }

    fn domain_freshness(&self, task: &Task, ctx: &ExecutionContext) -> f64 {
        task.domain
            .as_deref()
            .and_then(|d| ctx.domain_failure_rate(d))
            .map_or(1.0, |rate| 1.0 - rate)
    }

    fn worker_availability(&self, task: &Task, workers: &[Worker]) -> f64 {
        let domain = task.domain.as_deref();
        if !workers.iter().any(Worker::is_online) {
            return 0.0;
        }
        let capable_available = workers
            .iter()
            .any(|w| w.is_available() && w.can_handle(domain, task.complexity));
        if capable_available {
            1.0
        } else {
            self.config.unmatched_domain_score
        }
    }

    fn time_of_day(&self, ctx: &ExecutionContext) -> f64 {
        let windows = &ctx.preferences.preferred_windows;
        let hour = ctx.hour();
        if windows.is_empty() || windows.iter().any(|w| w.contains(hour)) {
            1.0
        } else {
            self.config.off_window_score
        }
    }

    fn user_preference(&self, task: &Task, ctx: &ExecutionContext) -> f64 {
        let prefs = &ctx.preferences;
        let preferred_domain = task
            .domain
            .as_ref()
            .is_some_and(|d| prefs.preferred_domains.contains(d));
        if preferred_domain || prefs.boosted_tasks.contains(&task.id) {
            1.0
        } else {
            self.config.neutral_preference
        }
    }

    /// Check whether a task should wait behind safer candidates.
    pub fn should_avoid(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        workers: &[Worker],
    ) -> Option<AvoidReason> {
        if let Some(domain) = task.domain.as_deref() {
            if let Some(rate) = ctx.domain_failure_rate(domain) {
                if rate > self.config.avoid_failure_rate {
                    return Some(AvoidReason::HighFailureRate {
                        domain: domain.to_string(),
                        rate,
                    });
                }
            }
            let count = ctx.consecutive_domain_failures(domain);
            if count >= self.config.avoid_consecutive_failures {
                return Some(AvoidReason::ConsecutiveFailures {
                    domain: domain.to_string(),
                    count,
                });
            }
        }

        if let Some(pinned) = &task.agent {
            let available = workers
                .iter()
                .any(|w| &w.id == pinned && w.status == WorkerStatus::Available);
            if !available {
                return Some(AvoidReason::PinnedWorkerUnavailable {
                    worker: pinned.clone(),
                });
            }
        }
        None
    }
}
