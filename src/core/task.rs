//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work routed to workers. Each task
//! carries its resolved priority, complexity and domain, the ids it
//! depends on, its lifecycle status and an append-only execution history.

use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier for a task, supplied by whoever owns the task records.
///
/// Ordered so that ties in scheduling resolve deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task priority. Declaration order is significance order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Linear normalization into `[0.25, 1.0]`.
    pub fn normalized(self) -> f64 {
        match self {
            Priority::Low => 0.25,
            Priority::Medium => 0.5,
            Priority::High => 0.75,
            Priority::Critical => 1.0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Resolved task complexity. Workers advertise the highest level they take.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// Inverted preference: simple work scores highest.
    pub fn preference(self) -> f64 {
        match self {
            Complexity::Simple => 1.0,
            Complexity::Moderate => 0.6,
            Complexity::Complex => 0.3,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// Task status in its lifecycle.
///
/// Pending → Ready → Running → {Completed | Failed | Blocked}. A failed
/// attempt with retries left goes back to Ready.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but dependencies not yet satisfied.
    #[default]
    Pending,
    /// Task dependencies satisfied, ready to be routed.
    Ready,
    /// Task is currently being executed by a worker.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed terminally.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task can never run without external replanning.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// Outcome of one attempt at a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub domain: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn success(
        task: &Task,
        worker_id: WorkerId,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            worker_id: Some(worker_id),
            domain: task.domain.clone(),
            success: true,
            error: None,
            started_at,
            finished_at,
        }
    }

    pub fn failure(
        task: &Task,
        worker_id: WorkerId,
        error: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            worker_id: Some(worker_id),
            domain: task.domain.clone(),
            success: false,
            error: Some(error.to_string()),
            started_at,
            finished_at,
        }
    }
}

/// A single unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Append-only list of attempt outcomes.
    #[serde(default)]
    pub history: Vec<ExecutionRecord>,
    /// Worker this task is pinned to, bypassing routing.
    #[serde(default)]
    pub agent: Option<WorkerId>,
    /// Per-task retry limit overriding the workflow default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Pre-approved for autonomous routing despite Critical priority.
    #[serde(default)]
    pub auto_approved: bool,
}

impl Task {
    /// Create a Pending task with medium priority and simple complexity.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            priority: Priority::default(),
            complexity: Complexity::default(),
            domain: None,
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            history: Vec::new(),
            agent: None,
            max_retries: None,
            auto_approved: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn pinned_to(mut self, worker: impl Into<WorkerId>) -> Self {
        self.agent = Some(worker.into());
        self
    }

    /// Override the workflow's retry limit for this task.
    ///
    /// Routing to a human still wins: once the task has failed
    /// `human_failure_threshold` times it is blocked for review, so
    /// retries at or beyond that count never run.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn auto_approved(mut self) -> Self {
        self.auto_approved = true;
        self
    }

    /// Transition Pending → Ready once dependencies are satisfied.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    /// Append an attempt outcome to the history.
    pub fn record(&mut self, record: ExecutionRecord) {
        self.history.push(record);
    }

    /// Number of failed attempts in the history.
    pub fn failure_count(&self) -> u32 {
        self.history.iter().filter(|r| !r.success).count() as u32
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Check if the task can be started (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}
