//! Wave-based workflow execution.
//!
//! The orchestrator owns a task graph per workflow and drives it to a
//! terminal state. Each pass ranks the ready set, routes up to
//! `max_concurrent_workers` tasks (at most one per worker), dispatches
//! them concurrently through the supervisor and folds the outcomes back
//! into the graph. A pass that changes nothing is a stall; stalls with a
//! recoverable cause back off, anything else ends the workflow.

use crate::clock::{self, Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::core::context::ExecutionContext;
use crate::core::dag::{DependencyGraph, ReadySet};
use crate::core::task::{ExecutionRecord, Task, TaskId, TaskStatus};
use crate::core::worker::{Worker, WorkerId, WorkerStatus};
use crate::orchestration::breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
use crate::orchestration::failsafe::{Condition, FailsafeMonitor, ResourceProbe, Severity, StaticProbe};
use crate::orchestration::registry::CapabilityRegistry;
use crate::orchestration::retry::{RetryDecision, RetryTracker};
use crate::orchestration::router::{RoutingDecision, TaskRouter};
use crate::orchestration::scorer::TaskScorer;
use crate::orchestration::supervisor::{
    Escalation, ExecutionOutcome, ExecutionSupervisor, SupervisorState, WorkerCall,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Unique identifier for a submitted workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Pending,
    Running,
    /// Every task completed.
    Completed,
    /// Every task reached a terminal state, some failed or blocked.
    CompletedWithFailures,
    Cancelled,
    /// Halted on escalated workers awaiting intervention.
    Stalled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowState::Pending | WorkflowState::Running)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Pending => write!(f, "pending"),
            WorkflowState::Running => write!(f, "running"),
            WorkflowState::Completed => write!(f, "completed"),
            WorkflowState::CompletedWithFailures => write!(f, "completed_with_failures"),
            WorkflowState::Cancelled => write!(f, "cancelled"),
            WorkflowState::Stalled => write!(f, "stalled"),
        }
    }
}

/// Point-in-time progress counts for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub id: WorkflowId,
    pub state: WorkflowState,
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub waves: u32,
    /// Longest chain of tasks still to finish.
    pub remaining_critical_path: usize,
}

/// Progress events broadcast while workflows run.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    WaveStarted {
        wave: u32,
        tasks: Vec<TaskId>,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskFailed {
        task_id: TaskId,
        worker_id: WorkerId,
        error: String,
        will_retry: bool,
    },
    TaskBlocked {
        task_id: TaskId,
        reason: String,
    },
    WaveCompleted {
        wave: u32,
        completed: usize,
        failed: usize,
    },
    Escalated {
        worker_id: WorkerId,
        severity: Severity,
    },
    AllTasksComplete {
        state: WorkflowState,
    },
}

/// One routing decision and the wave it was made in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub wave: u32,
    pub score: f64,
    pub decision: RoutingDecision,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveSummary {
    pub wave: u32,
    pub dispatched: Vec<TaskId>,
    pub completed: usize,
    pub failed: usize,
    /// Attempts handed back without an outcome (paused worker, open breaker).
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub reason: String,
}

/// Final account of a workflow, serializable to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub id: WorkflowId,
    pub state: WorkflowState,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskFailure>,
    pub blocked: Vec<TaskFailure>,
    pub critical_path: Vec<TaskId>,
    pub waves: Vec<WaveSummary>,
    pub decisions: Vec<TrailEntry>,
    pub escalations: Vec<Escalation>,
    pub breakers: Vec<BreakerSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.state == WorkflowState::Completed
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Mutable state of one workflow, shared with its handle.
#[derive(Debug)]
struct Run {
    id: WorkflowId,
    state: WorkflowState,
    graph: DependencyGraph,
    ctx: ExecutionContext,
    ready: ReadySet,
    retries: RetryTracker,
    running: HashSet<TaskId>,
    waves: Vec<WaveSummary>,
    trail: Vec<TrailEntry>,
    started_at: DateTime<Utc>,
}

impl Run {
    fn status(&self) -> WorkflowStatus {
        let mut status = WorkflowStatus {
            id: self.id,
            state: self.state,
            total: self.graph.len(),
            pending: 0,
            ready: 0,
            running: 0,
            completed: 0,
            failed: 0,
            blocked: 0,
            waves: self.waves.len() as u32,
            remaining_critical_path: 0,
        };
        let mut finished = HashSet::new();
        for task in self.graph.tasks() {
            match task.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Ready => status.ready += 1,
                TaskStatus::Running => status.running += 1,
                TaskStatus::Completed => status.completed += 1,
                TaskStatus::Failed { .. } => status.failed += 1,
                TaskStatus::Blocked { .. } => status.blocked += 1,
            }
            if task.is_finished() {
                finished.insert(task.id.clone());
            }
        }
        status.remaining_critical_path = self.graph.remaining_depth(&finished);
        status
    }

    fn all_finished(&self) -> bool {
        self.graph.tasks().all(Task::is_finished)
    }

    fn has_failures(&self) -> bool {
        self.graph
            .tasks()
            .any(|t| matches!(t.status, TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }))
    }
}

/// Tasks routed for one wave plus what happened while planning it.
#[derive(Debug, Default)]
struct WavePlan {
    dispatch: Vec<(Task, WorkerId)>,
    /// Tasks moved to Blocked during planning.
    transitions: usize,
    /// Ready tasks that found no free worker.
    deferred: usize,
}

#[derive(Debug)]
struct Dispatched {
    task: Task,
    worker_id: WorkerId,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: Result<ExecutionOutcome>,
}

#[derive(Debug, Default)]
struct Applied {
    transitions: usize,
    deferred: usize,
    summary: WaveSummary,
}

/// Handle to a workflow running in the background.
#[derive(Debug)]
pub struct WorkflowHandle {
    id: WorkflowId,
    run: Arc<RwLock<Run>>,
    cancel: CancellationToken,
    events: broadcast::Receiver<OrchestratorEvent>,
    join: JoinHandle<Result<WorkflowReport>>,
}

impl WorkflowHandle {
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.run.read().await.status()
    }

    /// Request cancellation. In-flight calls are abandoned and the
    /// workflow finishes with state Cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Events broadcast since the workflow was submitted.
    pub fn events(&mut self) -> &mut broadcast::Receiver<OrchestratorEvent> {
        &mut self.events
    }

    /// Wait for the workflow to finish.
    pub async fn wait(self) -> Result<WorkflowReport> {
        self.join
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}

/// Drives task graphs through routing, supervision and retries.
pub struct Orchestrator {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<CapabilityRegistry>,
    router: TaskRouter,
    supervisor: Arc<ExecutionSupervisor>,
    failsafe: Arc<FailsafeMonitor>,
    call: Arc<dyn WorkerCall>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workers", &self.registry.len())
            .field("max_concurrent_workers", &self.config.max_concurrent_workers)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator using the system clock and a zero-reading
    /// resource probe.
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<CapabilityRegistry>,
        call: Arc<dyn WorkerCall>,
    ) -> Result<Self> {
        Self::with_environment(
            config,
            registry,
            call,
            Arc::new(SystemClock),
            Arc::new(StaticProbe::default()),
        )
    }

    /// Create an orchestrator with an injected clock and resource probe.
    pub fn with_environment(
        config: OrchestratorConfig,
        registry: Arc<CapabilityRegistry>,
        call: Arc<dyn WorkerCall>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let scorer = TaskScorer::new(config.weights, config.scoring.clone())?;
        let router = TaskRouter::new(
            scorer,
            config.routing.clone(),
            config.human_failure_threshold,
        );
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config(), clock.clone()));
        let failsafe = Arc::new(FailsafeMonitor::new(
            config.failsafe_config(),
            clock.clone(),
            probe,
        ));
        let supervisor = Arc::new(ExecutionSupervisor::new(
            config.supervisor_config(),
            clock.clone(),
            breakers,
            failsafe.clone(),
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            clock,
            registry,
            router,
            supervisor,
            failsafe,
            call,
            events,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ExecutionSupervisor> {
        &self.supervisor
    }

    pub fn failsafe(&self) -> &Arc<FailsafeMonitor> {
        &self.failsafe
    }

    /// Subscribe to events from every workflow this orchestrator runs.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Run a task set to completion on the current task.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<WorkflowReport> {
        self.run_until_cancelled(tasks, CancellationToken::new()).await
    }

    pub async fn run_until_cancelled(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport> {
        let run = Arc::new(RwLock::new(self.prepare(tasks)?));
        self.drive(run, cancel).await
    }

    /// Validate a task set and start it in the background.
    ///
    /// Graph errors (duplicates, unknown dependencies, cycles) are
    /// returned here rather than from the handle.
    pub fn submit_task_set(self: &Arc<Self>, tasks: Vec<Task>) -> Result<WorkflowHandle> {
        let prepared = self.prepare(tasks)?;
        let id = prepared.id;
        let run = Arc::new(RwLock::new(prepared));
        let cancel = CancellationToken::new();
        let events = self.events.subscribe();

        let this = Arc::clone(self);
        let join = tokio::spawn({
            let run = Arc::clone(&run);
            let cancel = cancel.clone();
            async move { this.drive(run, cancel).await }
        });

        Ok(WorkflowHandle {
            id,
            run,
            cancel,
            events,
            join,
        })
    }

    fn prepare(&self, tasks: Vec<Task>) -> Result<Run> {
        let mut graph = DependencyGraph::build(tasks)?;
        let threshold = self.config.human_failure_threshold;
        for task in graph.tasks().filter(|t| t.max_retries.is_some_and(|n| n >= threshold)) {
            tracing::warn!(
                task = %task.id,
                max_retries = ?task.max_retries,
                human_failure_threshold = threshold,
                "retries at or past the human review threshold will not run"
            );
        }
        let ready = ReadySet::new(&graph);
        for id in ready.iter() {
            if let Some(task) = graph.get_mut(id) {
                task.mark_ready();
            }
        }
        let now = self.clock.now();
        let ctx = ExecutionContext::new(
            self.config.history_capacity,
            self.config.domain_window,
            now,
        )
        .with_preferences(self.config.preferences.clone());

        let id = WorkflowId::new();
        tracing::info!(workflow = %id.short(), tasks = graph.len(), "workflow prepared");
        Ok(Run {
            id,
            state: WorkflowState::Pending,
            graph,
            ctx,
            ready,
            retries: RetryTracker::new(),
            running: HashSet::new(),
            waves: Vec::new(),
            trail: Vec::new(),
            started_at: now,
        })
    }

    async fn drive(&self, run: Arc<RwLock<Run>>, cancel: CancellationToken) -> Result<WorkflowReport> {
        self.failsafe.refresh().await;
        let sampler_cancel = cancel.child_token();
        let sampler = Arc::clone(&self.failsafe)
            .spawn_sampler(self.config.sample_interval, sampler_cancel.clone());

        let result = self.wave_loop(&run, &cancel).await;

        sampler_cancel.cancel();
        if let Err(e) = sampler.await {
            tracing::warn!(error = %e, "failsafe sampler did not shut down cleanly");
        }

        let mut run = run.write().await;
        for task in run.graph.tasks() {
            self.failsafe.untrack_task(&task.id);
        }
        match result {
            Ok(state) => {
                run.state = state;
                let report = self.report(&run);
                tracing::info!(
                    workflow = %run.id.short(),
                    state = %report.state,
                    completed = report.completed.len(),
                    failed = report.failed.len(),
                    blocked = report.blocked.len(),
                    "workflow finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(workflow = %run.id.short(), error = %e, "workflow aborted");
                run.state = WorkflowState::Stalled;
                Err(e)
            }
        }
    }

    async fn wave_loop(&self, run: &RwLock<Run>, cancel: &CancellationToken) -> Result<WorkflowState> {
        run.write().await.state = WorkflowState::Running;
        let mut wave: u32 = 0;
        let mut stalled_passes: u32 = 0;
        let mut last_cooldown_wait = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(run).await);
            }

            {
                let guard = run.read().await;
                if guard.all_finished() {
                    let state = if guard.has_failures() {
                        WorkflowState::CompletedWithFailures
                    } else {
                        WorkflowState::Completed
                    };
                    self.emit(OrchestratorEvent::AllTasksComplete { state });
                    return Ok(state);
                }
            }

            for worker in self.supervisor.paused_workers() {
                if self.supervisor.auto_resume(&worker) {
                    tracing::info!(worker = %worker, "worker resumed");
                }
            }

            let plan = {
                let mut guard = run.write().await;
                self.plan_wave(&mut guard, wave + 1)
            };

            let mut applied = Applied::default();
            if !plan.dispatch.is_empty() {
                wave += 1;
                let ids: Vec<TaskId> = plan.dispatch.iter().map(|(t, _)| t.id.clone()).collect();
                tracing::info!(wave, tasks = ids.len(), "wave started");
                self.emit(OrchestratorEvent::WaveStarted { wave, tasks: ids });

                let results = futures::future::join_all(
                    plan.dispatch
                        .into_iter()
                        .map(|(task, worker)| self.dispatch(task, worker, cancel)),
                )
                .await;

                let mut guard = run.write().await;
                applied = self.apply(&mut guard, wave, results);
                self.emit(OrchestratorEvent::WaveCompleted {
                    wave,
                    completed: applied.summary.completed,
                    failed: applied.summary.failed,
                });
                tracing::info!(
                    wave,
                    completed = applied.summary.completed,
                    failed = applied.summary.failed,
                    deferred = applied.summary.deferred,
                    "wave completed"
                );
                guard.waves.push(std::mem::take(&mut applied.summary));
            }

            if plan.transitions + applied.transitions > 0 {
                stalled_passes = 0;
                last_cooldown_wait = None;
                continue;
            }
            if cancel.is_cancelled() {
                continue;
            }

            // Nothing changed this pass.
            let escalations = self.supervisor.escalations();
            if !escalations.is_empty() {
                tracing::error!(
                    escalated = escalations.len(),
                    "no progress possible while workers are escalated"
                );
                return Ok(WorkflowState::Stalled);
            }

            // A paused worker still cooling down will resume on its own. Waiting
            // for it is not a stall as long as the clock moves.
            if let Some(end) = self.supervisor.next_cooldown_end() {
                let now = self.clock.now();
                if last_cooldown_wait.map_or(true, |prev| now > prev) {
                    last_cooldown_wait = Some(now);
                    let wait = clock::elapsed(now, end);
                    tracing::debug!(
                        wait_ms = wait.as_millis() as u64,
                        "waiting for paused workers to cool down"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
            }

            let recoverable = applied.deferred > 0
                || self.supervisor.has_recoverable_pauses()
                || self
                    .registry
                    .snapshot()
                    .iter()
                    .any(|w| matches!(w.status, WorkerStatus::Busy | WorkerStatus::RateLimited));
            if recoverable && stalled_passes < self.config.max_stalled_passes {
                stalled_passes += 1;
                tracing::debug!(
                    pass = stalled_passes,
                    deferred = plan.deferred + applied.deferred,
                    backoff_ms = self.config.stall_backoff.as_millis() as u64,
                    "no progress, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.stall_backoff) => {}
                }
                continue;
            }

            let dump = self.stuck_dump(&*run.read().await)?;
            tracing::error!(stalled_passes, "workflow stuck");
            return Err(Error::StuckWorkflow { dump });
        }
    }

    /// Rank the ready set and route one task per free worker.
    fn plan_wave(&self, run: &mut Run, wave: u32) -> WavePlan {
        run.ctx.set_now(self.clock.now());
        let mut plan = WavePlan::default();

        let mut view: Vec<Worker> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|mut w| {
                if !self.supervisor.state(&w.id).accepts_work()
                    && w.status == WorkerStatus::Available
                {
                    w.status = WorkerStatus::Busy;
                }
                w
            })
            .collect();

        let mut ranking = {
            let ready: Vec<&Task> = run
                .ready
                .iter()
                .filter_map(|id| run.graph.get(id))
                .filter(|t| t.can_start())
                .collect();
            self.router.rank_candidates(&ready, &run.ctx, &view)
        };
        // Fresh work goes ahead of retries.
        ranking
            .candidates
            .sort_by_key(|c| run.retries.get_retries(&c.task_id) > 0);

        for (task_id, reason) in ranking.invalid {
            plan.transitions += self.block(run, &task_id, &reason);
            plan.transitions += self.block_dependents(run, &task_id);
        }

        for candidate in ranking.candidates {
            if plan.dispatch.len() >= self.config.max_concurrent_workers {
                break;
            }
            let Some(task) = run.graph.get(&candidate.task_id) else {
                continue;
            };
            let decision = self.router.route_to_agent(task, &run.ctx, &view);
            run.trail.push(TrailEntry {
                wave,
                score: candidate.score,
                decision: decision.clone(),
            });

            if decision.requires_human() {
                tracing::info!(task = %candidate.task_id, reason = %decision.reasoning, "routing to human");
                plan.transitions += self.block(run, &candidate.task_id, &decision.reasoning);
                plan.transitions += self.block_dependents(run, &candidate.task_id);
                continue;
            }

            let doubtful = decision
                .worker_id
                .as_ref()
                .and_then(|_| self.failsafe.assess_confidence(decision.confidence));
            if let Some(condition) = doubtful {
                let reason = format!("needs human review: {}", condition.message);
                tracing::warn!(
                    task = %candidate.task_id,
                    worker = ?decision.worker_id,
                    confidence = decision.confidence,
                    "routing confidence too low"
                );
                plan.transitions += self.block(run, &candidate.task_id, &reason);
                plan.transitions += self.block_dependents(run, &candidate.task_id);
                continue;
            }

            let free = decision
                .worker_id
                .as_ref()
                .and_then(|id| view.iter_mut().find(|w| &w.id == id))
                .filter(|w| w.is_available());
            let Some(worker) = free else {
                tracing::debug!(
                    task = %candidate.task_id,
                    worker = ?decision.worker_id,
                    "no free worker, deferring"
                );
                plan.deferred += 1;
                continue;
            };
            worker.status = WorkerStatus::Busy;
            let worker_id = worker.id.clone();

            if let Some(task) = run.graph.get_mut(&candidate.task_id) {
                task.start();
                plan.dispatch.push((task.clone(), worker_id));
                run.running.insert(candidate.task_id);
            }
        }
        plan
    }

    async fn dispatch(&self, task: Task, worker_id: WorkerId, cancel: &CancellationToken) -> Dispatched {
        let claimed = self
            .registry
            .get(&worker_id)
            .is_some_and(|w| w.status == WorkerStatus::Available);
        if claimed {
            if let Err(e) = self.registry.set_status(&worker_id, WorkerStatus::Busy) {
                tracing::warn!(worker = %worker_id, error = %e, "could not mark worker busy");
            }
        }
        self.emit(OrchestratorEvent::TaskStarted {
            task_id: task.id.clone(),
            worker_id: worker_id.clone(),
        });
        tracing::debug!(task = %task.id, worker = %worker_id, "dispatching task");

        let started_at = self.clock.now();
        let result = self
            .supervisor
            .execute(&worker_id, &task, self.call.as_ref(), cancel)
            .await;
        let finished_at = self.clock.now();

        let still_busy = self
            .registry
            .get(&worker_id)
            .is_some_and(|w| w.status == WorkerStatus::Busy);
        if claimed && still_busy {
            if let Err(e) = self.registry.set_status(&worker_id, WorkerStatus::Available) {
                tracing::warn!(worker = %worker_id, error = %e, "could not release worker");
            }
        }

        Dispatched {
            task,
            worker_id,
            started_at,
            finished_at,
            result,
        }
    }

    /// Fold a wave's outcomes into the run.
    fn apply(&self, run: &mut Run, wave: u32, results: Vec<Dispatched>) -> Applied {
        let mut applied = Applied {
            summary: WaveSummary {
                wave,
                dispatched: results.iter().map(|d| d.task.id.clone()).collect(),
                ..Default::default()
            },
            ..Default::default()
        };

        for dispatched in results {
            let Dispatched {
                task,
                worker_id,
                started_at,
                finished_at,
                result,
            } = dispatched;
            run.running.remove(&task.id);

            match result {
                Ok(ExecutionOutcome::Succeeded { .. }) => {
                    let record = ExecutionRecord::success(&task, worker_id.clone(), started_at, finished_at);
                    self.record_outcome(run, &worker_id, record);
                    self.complete(run, &task.id);
                    self.emit(OrchestratorEvent::TaskCompleted {
                        task_id: task.id.clone(),
                        worker_id,
                    });
                    applied.summary.completed += 1;
                    applied.transitions += 1;
                }
                Ok(ExecutionOutcome::Failed { error }) => {
                    let record =
                        ExecutionRecord::failure(&task, worker_id.clone(), &error, started_at, finished_at);
                    self.record_outcome(run, &worker_id, record);
                    applied.summary.failed += 1;
                    applied.transitions += 1;

                    let max_retries = task.max_retries.unwrap_or(self.config.max_retries);
                    match run.retries.record_failure(&task.id, max_retries) {
                        RetryDecision::Retry { attempt } => {
                            tracing::warn!(task = %task.id, attempt, %error, "task failed, will retry");
                            if let Some(t) = run.graph.get_mut(&task.id) {
                                t.mark_ready();
                            }
                            self.emit(OrchestratorEvent::TaskFailed {
                                task_id: task.id.clone(),
                                worker_id,
                                error,
                                will_retry: true,
                            });
                        }
                        RetryDecision::Exhausted { attempts } => {
                            let reason = format!(
                                "{} (last error: {})",
                                Error::TaskExhaustedRetries {
                                    task: task.id.clone(),
                                    attempts,
                                },
                                error
                            );
                            tracing::error!(task = %task.id, attempts, %error, "task exhausted retries");
                            self.fail(run, &task.id, &reason);
                            self.emit(OrchestratorEvent::TaskFailed {
                                task_id: task.id.clone(),
                                worker_id,
                                error,
                                will_retry: false,
                            });
                            applied.transitions += self.block_dependents(run, &task.id);
                        }
                    }
                }
                Err(e) => {
                    if let Some(t) = run.graph.get_mut(&task.id) {
                        t.mark_ready();
                    }
                    applied.summary.deferred += 1;
                    applied.deferred += 1;
                    if let Error::FailsafeTriggered { severity, .. } = &e {
                        if !severity.is_auto_recoverable() {
                            self.emit(OrchestratorEvent::Escalated {
                                worker_id: worker_id.clone(),
                                severity: *severity,
                            });
                        }
                    }
                    if e.is_recoverable() {
                        tracing::debug!(task = %task.id, worker = %worker_id, error = %e, "attempt deferred");
                    } else {
                        tracing::warn!(task = %task.id, worker = %worker_id, error = %e, "attempt halted");
                    }
                }
            }
        }
        applied
    }

    fn record_outcome(&self, run: &mut Run, worker_id: &WorkerId, record: ExecutionRecord) {
        if let Err(e) = self
            .registry
            .record_outcome(worker_id, record.domain.as_deref(), record.success)
        {
            tracing::warn!(worker = %worker_id, error = %e, "could not update worker stats");
        }
        if let Some(task) = run.graph.get_mut(&record.task_id) {
            task.record(record.clone());
        }
        run.ctx.record(record);
    }

    fn complete(&self, run: &mut Run, id: &TaskId) {
        if let Some(task) = run.graph.get_mut(id) {
            task.complete();
        }
        run.ctx.mark_completed(id);
        run.retries.reset(id);
        let newly_ready = run.ready.complete(&run.graph, id);
        for ready in newly_ready {
            if let Some(task) = run.graph.get_mut(&ready) {
                task.mark_ready();
            }
        }
    }

    fn fail(&self, run: &mut Run, id: &TaskId, reason: &str) {
        if let Some(task) = run.graph.get_mut(id) {
            task.fail(reason);
        }
        run.ctx.mark_failed(id, reason);
        run.ready.remove(id);
        self.failsafe.untrack_task(id);
    }

    /// Block one unfinished task. Returns 1 if its status changed.
    fn block(&self, run: &mut Run, id: &TaskId, reason: &str) -> usize {
        let Some(task) = run.graph.get_mut(id) else {
            return 0;
        };
        if task.is_finished() {
            return 0;
        }
        task.block(reason);
        run.ready.remove(id);
        self.failsafe.untrack_task(id);
        self.emit(OrchestratorEvent::TaskBlocked {
            task_id: id.clone(),
            reason: reason.to_string(),
        });
        1
    }

    /// Block every unfinished task downstream of `id`.
    fn block_dependents(&self, run: &mut Run, id: &TaskId) -> usize {
        let reason = format!("dependency {} did not complete", id);
        run.graph
            .transitive_dependents(id)
            .iter()
            .map(|dependent| self.block(run, dependent, &reason))
            .sum()
    }

    async fn cancelled(&self, run: &RwLock<Run>) -> WorkflowState {
        let mut guard = run.write().await;
        let running: Vec<TaskId> = guard.running.drain().collect();
        for id in running {
            if let Some(task) = guard.graph.get_mut(&id) {
                task.mark_ready();
            }
        }
        tracing::info!(workflow = %guard.id.short(), "workflow cancelled");
        WorkflowState::Cancelled
    }

    fn report(&self, run: &Run) -> WorkflowReport {
        let mut report = WorkflowReport {
            id: run.id,
            state: run.state,
            completed: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            critical_path: run.graph.critical_path(),
            waves: run.waves.clone(),
            decisions: run.trail.clone(),
            escalations: self.supervisor.escalations(),
            breakers: self.supervisor.breakers().snapshots(),
            started_at: run.started_at,
            finished_at: self.clock.now(),
        };
        for task in run.graph.topological_order() {
            match &task.status {
                TaskStatus::Completed => report.completed.push(task.id.clone()),
                TaskStatus::Failed { error } => report.failed.push(TaskFailure {
                    task_id: task.id.clone(),
                    reason: error.clone(),
                }),
                TaskStatus::Blocked { reason } => report.blocked.push(TaskFailure {
                    task_id: task.id.clone(),
                    reason: reason.clone(),
                }),
                _ => {}
            }
        }
        report
    }

    fn stuck_dump(&self, run: &Run) -> Result<String> {
        #[derive(Serialize)]
        struct WorkerDump {
            id: WorkerId,
            status: WorkerStatus,
            supervision: SupervisorState,
            breaker: Option<BreakerState>,
        }

        #[derive(Serialize)]
        struct StuckDump<'a> {
            workflow: WorkflowId,
            tasks: Vec<(TaskId, TaskStatus)>,
            ready: Vec<&'a TaskId>,
            workers: Vec<WorkerDump>,
            conditions: Vec<Condition>,
        }

        let workers = self
            .registry
            .snapshot()
            .into_iter()
            .map(|w| WorkerDump {
                supervision: self.supervisor.state(&w.id),
                breaker: self.supervisor.breakers().state(&w.id),
                status: w.status,
                id: w.id,
            })
            .collect();
        let dump = StuckDump {
            workflow: run.id,
            tasks: run.graph.statuses(),
            ready: run.ready.iter().collect(),
            workers,
            conditions: self.failsafe.latest(),
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
