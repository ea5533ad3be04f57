//! Core domain models for the orchestrator.
//!
//! Tasks, workers, the dependency graph and the execution context that
//! scoring and routing read from.

pub mod context;
pub mod dag;
pub mod task;
pub mod worker;

pub use context::{DomainStats, ExecutionContext, HourWindow, UserPreferences};
pub use dag::{DependencyGraph, ReadySet};
pub use task::{Complexity, ExecutionRecord, Priority, Task, TaskId, TaskStatus};
pub use worker::{FailureRecord, Worker, WorkerId, WorkerStatus};
