use crate::core::task::TaskId;
use crate::core::worker::WorkerId;
use crate::orchestration::failsafe::Severity;
use crate::orchestration::supervisor::SupervisorState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Dependency cycle detected among tasks: {}", join_ids(remaining))]
    CycleDetected { remaining: Vec<TaskId> },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scoring weights must sum to 1.0 (got {sum})")]
    InvalidWeights { sum: f64 },

    #[error("Circuit open for worker {worker}")]
    CircuitOpen { worker: WorkerId },

    #[error("Worker {worker} is not running (state: {state})")]
    WorkerPaused {
        worker: WorkerId,
        state: SupervisorState,
    },

    #[error("Failsafe triggered ({severity}): {}", conditions.join("; "))]
    FailsafeTriggered {
        severity: Severity,
        conditions: Vec<String>,
    },

    #[error("Workflow stuck: no task changed state during a full pass\n{dump}")]
    StuckWorkflow { dump: String },

    #[error("Task {task} exhausted its retries after {attempts} attempts")]
    TaskExhaustedRetries { task: TaskId, attempts: u32 },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether the caller can back off and retry without treating the
    /// task as failed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::CircuitOpen { .. } | Error::WorkerPaused { .. } | Error::Cancelled => true,
            Error::FailsafeTriggered { severity, .. } => *severity <= Severity::Medium,
            _ => false,
        }
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
