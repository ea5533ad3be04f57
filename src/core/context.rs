//! Live execution context consulted by scoring and routing.
//!
//! Holds the completed/failed sets, per-domain failure tracking and a
//! bounded ring of recent execution records.

use crate::core::task::{ExecutionRecord, TaskId};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// An hour-of-day window `[start, end)` in UTC. Wraps past midnight when
/// `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start % 24,
            end: end % 24,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// Preferences supplied by the user of the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    /// Hours during which work is preferred. Empty means any time.
    pub preferred_windows: Vec<HourWindow>,
    pub preferred_domains: BTreeSet<String>,
    pub boosted_tasks: BTreeSet<TaskId>,
}

/// Failure tracking for one domain.
#[derive(Debug, Clone, Default)]
pub struct DomainStats {
    /// Most recent outcomes, oldest first. `true` is success.
    recent: VecDeque<bool>,
    consecutive_failures: u32,
}

impl DomainStats {
    fn push(&mut self, success: bool, window: usize) {
        if window > 0 {
            if self.recent.len() == window {
                self.recent.pop_front();
            }
            self.recent.push_back(success);
        }
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    pub fn failure_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / self.recent.len() as f64)
    }

    pub fn samples(&self) -> usize {
        self.recent.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub completed: HashSet<TaskId>,
    /// Terminally failed tasks and their reason.
    pub failed: HashMap<TaskId, String>,
    domains: HashMap<String, DomainStats>,
    history: VecDeque<ExecutionRecord>,
    history_capacity: usize,
    domain_window: usize,
    pub now: DateTime<Utc>,
    pub preferences: UserPreferences,
}

impl ExecutionContext {
    /// Create an empty context.
    ///
    /// * `history_capacity` - size of the execution-history ring
    /// * `domain_window` - trailing outcomes considered per domain
    pub fn new(history_capacity: usize, domain_window: usize, now: DateTime<Utc>) -> Self {
        Self {
            completed: HashSet::new(),
            failed: HashMap::new(),
            domains: HashMap::new(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            domain_window,
            now,
            preferences: UserPreferences::default(),
        }
    }

    pub fn with_preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn set_now(&mut self, now: DateTime<Utc>) {
        self.now = now;
    }

    pub fn hour(&self) -> u32 {
        self.now.hour()
    }

    /// Append an attempt outcome, updating domain statistics.
    pub fn record(&mut self, record: ExecutionRecord) {
        if let Some(domain) = &record.domain {
            self.domains
                .entry(domain.clone())
                .or_default()
                .push(record.success, self.domain_window);
        }
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn mark_completed(&mut self, id: &TaskId) {
        self.failed.remove(id);
        self.completed.insert(id.clone());
    }

    pub fn mark_failed(&mut self, id: &TaskId, reason: &str) {
        self.failed.insert(id.clone(), reason.to_string());
    }

    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    pub fn domain(&self, domain: &str) -> Option<&DomainStats> {
        self.domains.get(domain)
    }

    /// Failure rate over the trailing window, `None` without samples.
    pub fn domain_failure_rate(&self, domain: &str) -> Option<f64> {
        self.domains.get(domain).and_then(DomainStats::failure_rate)
    }

    pub fn consecutive_domain_failures(&self, domain: &str) -> u32 {
        self.domains
            .get(domain)
            .map_or(0, DomainStats::consecutive_failures)
    }

    /// Recent execution records, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
