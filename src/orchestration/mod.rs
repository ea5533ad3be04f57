//! Orchestration layer.
//!
//! Components that turn a task graph into supervised worker calls:
//! scoring and routing pick what runs where, the breaker and failsafe
//! monitor decide whether it may run, and the orchestrator drives the
//! waves.

pub mod breaker;
pub mod failsafe;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod router;
pub mod scorer;
pub mod supervisor;

pub use breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, BreakerSnapshot, BreakerState, BreakerStats,
    CircuitBreaker,
};
pub use failsafe::{
    Condition, ConditionKind, FailsafeConfig, FailsafeMonitor, ResourceProbe, ResourceThreshold,
    ResourceThresholds, ResourceUsage, Severity, StaticProbe,
};
pub use orchestrator::{
    Orchestrator, OrchestratorEvent, TaskFailure, TrailEntry, WaveSummary, WorkflowHandle,
    WorkflowId, WorkflowReport, WorkflowState, WorkflowStatus,
};
pub use registry::{CapabilityRegistry, SUCCESS_RATE_ALPHA};
pub use retry::{RetryDecision, RetryTracker};
pub use router::{
    Candidate, Ranking, RouteSource, RoutingDecision, RoutingTable, Selection, TaskRouter,
};
pub use scorer::{AvoidReason, ScoreBreakdown, ScorerConfig, ScoringWeights, TaskScorer};
pub use supervisor::{
    Escalation, ExecutionOutcome, ExecutionSupervisor, Supervision, SupervisorConfig,
    SupervisorState, WorkerCall,
};
