//! Autonomous execution of interdependent tasks across a pool of
//! heterogeneous workers.
//!
//! Callers register workers with a [`CapabilityRegistry`], hand a task set
//! to an [`Orchestrator`] and receive a [`WorkflowReport`]. Worker
//! invocation is supplied as a [`WorkerCall`] callback; everything about
//! how a worker actually runs a task stays outside this crate.

pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod orchestration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use crate::core::{
    Complexity, DependencyGraph, ExecutionContext, Priority, Task, TaskId, TaskStatus, Worker,
    WorkerId, WorkerStatus,
};
pub use error::{Error, Result};
pub use orchestration::{
    CapabilityRegistry, CircuitBreaker, ExecutionSupervisor, FailsafeMonitor, Orchestrator,
    OrchestratorEvent, TaskRouter, TaskScorer, WorkerCall, WorkflowHandle, WorkflowReport,
    WorkflowState,
};
