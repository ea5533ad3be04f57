//! Execution supervisor.
//!
//! Every worker call goes through [`ExecutionSupervisor::execute`], which
//! consults the failsafe monitor, routes the call through the worker's
//! circuit breaker and bounds it by a timeout and the workflow's cancel
//! token. The supervisor is the only component that acts on failsafe
//! conditions: it pauses workers for recoverable conditions and escalates
//! them for the rest.

use crate::clock::{self, Clock};
use crate::core::task::Task;
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use crate::orchestration::breaker::{BreakerError, BreakerRegistry, BreakerState};
use crate::orchestration::failsafe::{max_severity, Condition, FailsafeMonitor};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Supervision state of one worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Running,
    /// Halted for a recoverable reason; may auto-resume.
    Paused,
    /// Halted by request.
    Stopped,
    /// Resumed after a pause. The next call is a trial: success returns
    /// the worker to Running, failure pauses it again.
    Recovering,
    /// Halted until a human unblocks it.
    Escalated,
}

impl SupervisorState {
    /// Whether the worker may take calls in this state.
    pub fn accepts_work(self) -> bool {
        matches!(self, SupervisorState::Running | SupervisorState::Recovering)
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Paused => write!(f, "paused"),
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Recovering => write!(f, "recovering"),
            SupervisorState::Escalated => write!(f, "escalated"),
        }
    }
}

/// Result of a call that reached the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded { output: String },
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }
}

/// Callback that hands a task to a worker.
///
/// Implemented for any `Fn(WorkerId, Task) -> Future` closure.
pub trait WorkerCall: Send + Sync {
    fn call(&self, worker: &WorkerId, task: &Task) -> BoxFuture<'static, std::result::Result<String, String>>;
}

impl<F, Fut> WorkerCall for F
where
    F: Fn(WorkerId, Task) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<String, String>> + Send + 'static,
{
    fn call(&self, worker: &WorkerId, task: &Task) -> BoxFuture<'static, std::result::Result<String, String>> {
        Box::pin(self(worker.clone(), task.clone()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Upper bound on a single worker call.
    pub task_timeout: Duration,
    pub auto_resume_enabled: bool,
    /// Age after which an unresolved escalation is reported as stale.
    pub escalation_timeout: Duration,
    /// Time a paused worker waits before error-rate and consecutive-error
    /// conditions stop holding it back.
    pub pause_cooldown: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(900),
            auto_resume_enabled: true,
            escalation_timeout: Duration::from_secs(1800),
            pause_cooldown: Duration::from_secs(30),
        }
    }
}

/// An escalated worker awaiting intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub worker_id: WorkerId,
    pub conditions: Vec<Condition>,
    pub at: DateTime<Utc>,
    /// Unresolved for longer than the escalation timeout.
    pub stale: bool,
}

/// Per-worker supervision counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Supervision {
    pub state: SupervisorState,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    paused_at: Option<DateTime<Utc>>,
    escalation: Option<(DateTime<Utc>, Vec<Condition>)>,
}

#[derive(Debug)]
pub struct ExecutionSupervisor {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    breakers: Arc<BreakerRegistry>,
    failsafe: Arc<FailsafeMonitor>,
    workers: Mutex<HashMap<WorkerId, Supervision>>,
}

impl ExecutionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        breakers: Arc<BreakerRegistry>,
        failsafe: Arc<FailsafeMonitor>,
    ) -> Self {
        Self {
            config,
            clock,
            breakers,
            failsafe,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn failsafe(&self) -> &Arc<FailsafeMonitor> {
        &self.failsafe
    }

    /// Supervision state of a worker. Workers never seen are Running.
    pub fn state(&self, worker: &WorkerId) -> SupervisorState {
        self.lock().get(worker).map(|s| s.state).unwrap_or_default()
    }

    pub fn supervision(&self, worker: &WorkerId) -> Supervision {
        self.lock().get(worker).cloned().unwrap_or_default()
    }

    /// Run one attempt of `task` on `worker`.
    ///
    /// # Returns
    ///
    /// * `Ok(outcome)` - the call reached the worker and finished
    /// * `Err(WorkerPaused)` - the worker is neither Running nor Recovering
    /// * `Err(FailsafeTriggered)` - a condition halted the worker before dispatch
    /// * `Err(CircuitOpen)` - the worker's breaker rejected the call
    /// * `Err(Cancelled)` - `cancel` fired while the call was in flight
    pub async fn execute(
        &self,
        worker: &WorkerId,
        task: &Task,
        call: &dyn WorkerCall,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let state = self.state(worker);
        if !state.accepts_work() {
            return Err(Error::WorkerPaused {
                worker: worker.clone(),
                state,
            });
        }

        let conditions = self.failsafe.check_all();
        if let Some(severity) = max_severity(&conditions) {
            let messages: Vec<String> = conditions.iter().map(|c| c.message.clone()).collect();
            if severity.is_auto_recoverable() {
                tracing::warn!(worker = %worker, %severity, "pausing worker on failsafe condition");
                self.pause(worker);
            } else {
                tracing::error!(
                    worker = %worker,
                    %severity,
                    conditions = ?messages,
                    "escalating worker on failsafe condition"
                );
                self.escalate(worker, conditions);
            }
            return Err(Error::FailsafeTriggered {
                severity,
                conditions: messages,
            });
        }

        self.failsafe.track_task(&task.id);
        self.failsafe.record_iteration(&task.id);

        let breaker = self.breakers.get(worker);
        let timeout = self.config.task_timeout;
        let guarded = breaker.execute(|| {
            let fut = call.call(worker, task);
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                }
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(worker = %worker, task = %task.id, "call cancelled");
                self.failsafe.untrack_task(&task.id);
                return Err(Error::Cancelled);
            }
            result = guarded => result,
        };

        match result {
            Err(BreakerError::Open) => {
                tracing::warn!(worker = %worker, "circuit open, pausing worker");
                self.failsafe.untrack_task(&task.id);
                self.pause(worker);
                Err(Error::CircuitOpen {
                    worker: worker.clone(),
                })
            }
            Ok(output) => {
                self.failsafe.record_result(true);
                self.failsafe.untrack_task(&task.id);
                let mut workers = self.lock();
                let supervision = workers.entry(worker.clone()).or_default();
                if supervision.state == SupervisorState::Recovering {
                    tracing::info!(worker = %worker, "worker recovered");
                    supervision.state = SupervisorState::Running;
                }
                supervision.consecutive_failures = 0;
                supervision.recovery_attempts = 0;
                Ok(ExecutionOutcome::Succeeded { output })
            }
            Err(BreakerError::Inner(error)) => {
                self.failsafe.record_result(false);
                self.failsafe.record_progress(&task.id);
                self.lock()
                    .entry(worker.clone())
                    .or_default()
                    .consecutive_failures += 1;
                if breaker.state() == BreakerState::Open {
                    tracing::warn!(worker = %worker, "breaker opened, pausing worker");
                    self.pause(worker);
                } else if self.state(worker) == SupervisorState::Recovering {
                    tracing::warn!(worker = %worker, "trial call failed, pausing worker");
                    self.pause(worker);
                }
                Ok(ExecutionOutcome::Failed { error })
            }
        }
    }

    /// Try to move a paused worker to Recovering.
    ///
    /// Requires auto-resume enabled and the worker's breaker not Open. Any
    /// failsafe condition holds the worker back, except that once the
    /// pause has lasted `pause_cooldown` conditions raised only by the
    /// outcome history are waived and that history is cleared. No new
    /// outcomes arrive while every worker is paused, so those conditions
    /// could not clear otherwise.
    pub fn auto_resume(&self, worker: &WorkerId) -> bool {
        if !self.config.auto_resume_enabled || self.state(worker) != SupervisorState::Paused {
            return false;
        }
        if self.breakers.state(worker) == Some(BreakerState::Open) {
            return false;
        }

        let conditions = self.failsafe.check_all();
        if !conditions.is_empty() {
            let cooled = self
                .supervision(worker)
                .paused_at
                .is_some_and(|at| clock::elapsed(at, self.clock.now()) >= self.config.pause_cooldown);
            if !cooled || !conditions.iter().all(|c| c.kind.is_outcome_driven()) {
                return false;
            }
            tracing::info!(
                worker = %worker,
                conditions = conditions.len(),
                "pause cooldown elapsed, clearing outcome history"
            );
            self.failsafe.reset_outcomes();
        }

        let mut workers = self.lock();
        let supervision = workers.entry(worker.clone()).or_default();
        supervision.state = SupervisorState::Recovering;
        supervision.paused_at = None;
        supervision.recovery_attempts += 1;
        tracing::info!(
            worker = %worker,
            attempt = supervision.recovery_attempts,
            "worker recovering"
        );
        true
    }

    /// Earliest time a cooling-down pause ends, if any is still pending.
    ///
    /// Workers held by an Open breaker are left out; their breaker
    /// timeout governs when they can return.
    pub fn next_cooldown_end(&self) -> Option<DateTime<Utc>> {
        if !self.config.auto_resume_enabled {
            return None;
        }
        let now = self.clock.now();
        let pauses: Vec<(WorkerId, DateTime<Utc>)> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.state == SupervisorState::Paused)
            .filter_map(|(id, s)| Some((id.clone(), s.paused_at?)))
            .collect();
        pauses
            .into_iter()
            .filter(|(id, _)| self.breakers.state(id) != Some(BreakerState::Open))
            .map(|(_, at)| clock::add(at, self.config.pause_cooldown))
            .filter(|end| *end > now)
            .min()
    }

    /// Explicitly resume a halted worker, clearing any escalation.
    pub fn unblock(&self, worker: &WorkerId) -> bool {
        let mut workers = self.lock();
        let Some(supervision) = workers.get_mut(worker) else {
            return false;
        };
        if supervision.state == SupervisorState::Running {
            return false;
        }
        tracing::info!(worker = %worker, from = %supervision.state, "worker unblocked");
        supervision.state = SupervisorState::Running;
        supervision.escalation = None;
        supervision.paused_at = None;
        supervision.recovery_attempts = 0;
        true
    }

    pub fn stop(&self, worker: &WorkerId) {
        tracing::info!(worker = %worker, "worker stopped");
        self.set_state(worker, SupervisorState::Stopped);
    }

    /// Unresolved escalations, sorted by worker id.
    pub fn escalations(&self) -> Vec<Escalation> {
        let now = self.clock.now();
        let mut escalations: Vec<Escalation> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.state == SupervisorState::Escalated)
            .filter_map(|(id, s)| {
                let (at, conditions) = s.escalation.clone()?;
                Some(Escalation {
                    worker_id: id.clone(),
                    stale: clock::elapsed(at, now) >= self.config.escalation_timeout,
                    conditions,
                    at,
                })
            })
            .collect();
        escalations.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        escalations
    }

    /// Workers currently Paused.
    pub fn paused_workers(&self) -> Vec<WorkerId> {
        let mut paused: Vec<WorkerId> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.state == SupervisorState::Paused)
            .map(|(id, _)| id.clone())
            .collect();
        paused.sort();
        paused
    }

    /// Whether some worker is paused and may come back on its own.
    pub fn has_recoverable_pauses(&self) -> bool {
        self.config.auto_resume_enabled && !self.paused_workers().is_empty()
    }

    fn escalate(&self, worker: &WorkerId, conditions: Vec<Condition>) {
        let now = self.clock.now();
        let mut workers = self.lock();
        let supervision = workers.entry(worker.clone()).or_default();
        supervision.state = SupervisorState::Escalated;
        supervision.escalation = Some((now, conditions));
    }

    fn pause(&self, worker: &WorkerId) {
        let now = self.clock.now();
        let mut workers = self.lock();
        let supervision = workers.entry(worker.clone()).or_default();
        supervision.state = SupervisorState::Paused;
        supervision.paused_at = Some(now);
    }

    fn set_state(&self, worker: &WorkerId, state: SupervisorState) {
        self.lock().entry(worker.clone()).or_default().state = state;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, Supervision>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
