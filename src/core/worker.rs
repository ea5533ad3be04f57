//! Worker records.
//!
//! A worker ("agent") advertises the domains it handles and the highest
//! complexity it accepts. Its success rate is an exponential moving
//! average over reported outcomes.

use crate::core::task::Complexity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Upper bound on the recent-failure ring kept per worker.
pub const RECENT_FAILURE_CAPACITY: usize = 10;

/// Identifier for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Availability of a worker as reported by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Available,
    Busy,
    Offline,
    RateLimited,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Available => write!(f, "available"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
            WorkerStatus::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// A failed outcome kept in the worker's recent-failure ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub domain: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub domains: BTreeSet<String>,
    pub max_complexity: Complexity,
    pub status: WorkerStatus,
    /// EMA of outcomes, always within `[0, 1]`.
    pub success_rate: f64,
    pub recent_failures: VecDeque<FailureRecord>,
    pub last_used: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(
        id: impl Into<WorkerId>,
        domains: impl IntoIterator<Item = impl Into<String>>,
        max_complexity: Complexity,
        initial_success_rate: f64,
    ) -> Self {
        Self {
            id: id.into(),
            domains: domains.into_iter().map(Into::into).collect(),
            max_complexity,
            status: WorkerStatus::Available,
            success_rate: clamp_rate(initial_success_rate),
            recent_failures: VecDeque::with_capacity(RECENT_FAILURE_CAPACITY),
            last_used: None,
        }
    }

    /// A task without a domain can go to any worker.
    pub fn handles_domain(&self, domain: Option<&str>) -> bool {
        domain.map_or(true, |d| self.domains.contains(d))
    }

    pub fn can_handle(&self, domain: Option<&str>, complexity: Complexity) -> bool {
        self.handles_domain(domain) && complexity <= self.max_complexity
    }

    pub fn is_online(&self) -> bool {
        self.status != WorkerStatus::Offline
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Available
    }

    /// Fold one outcome into the success rate and failure ring.
    pub fn record_outcome(
        &mut self,
        domain: Option<&str>,
        success: bool,
        alpha: f64,
        at: DateTime<Utc>,
    ) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = clamp_rate(alpha * sample + (1.0 - alpha) * self.success_rate);
        self.last_used = Some(at);

        if !success {
            if self.recent_failures.len() == RECENT_FAILURE_CAPACITY {
                self.recent_failures.pop_front();
            }
            self.recent_failures.push_back(FailureRecord {
                domain: domain.map(str::to_string),
                at,
            });
        }
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}
