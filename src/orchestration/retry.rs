//! Per-task failed-attempt bookkeeping.

use crate::core::task::TaskId;
use std::collections::HashMap;

/// What to do with a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back in the ready set.
    Retry { attempt: u32 },
    /// Fail the task terminally.
    Exhausted { attempts: u32 },
}

/// Counts failed attempts per task.
///
/// A task with `max_retries = n` gets `n + 1` attempts in total.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    failures: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed attempts recorded for a task, 0 if none.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.failures.get(task_id).copied().unwrap_or(0)
    }

    /// Record one failed attempt and return the new count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.failures.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Record a failure and decide whether the task gets another attempt.
    pub fn record_failure(&mut self, task_id: &TaskId, max_retries: u32) -> RetryDecision {
        let attempts = self.increment(task_id);
        if attempts > max_retries {
            RetryDecision::Exhausted { attempts }
        } else {
            RetryDecision::Retry { attempt: attempts }
        }
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.failures.remove(task_id);
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
