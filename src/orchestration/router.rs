//! Task selection and worker routing.
//!
//! The router answers two questions each pass: which ready task should
//! run next, and which worker should run it. Worker resolution walks a
//! fixed chain: pinned worker, human routing, domain default, capability
//! ranking, configured fallback.

use crate::core::context::ExecutionContext;
use crate::core::dag::DependencyGraph;
use crate::core::task::{Complexity, Priority, Task, TaskId};
use crate::core::worker::{Worker, WorkerId};
use crate::orchestration::registry::rank_capable;
use crate::orchestration::scorer::{AvoidReason, TaskScorer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of alternative workers listed in a decision.
pub const MAX_ALTERNATIVES: usize = 3;

/// Static routing preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingTable {
    /// Preferred worker per domain.
    pub domain_defaults: BTreeMap<String, WorkerId>,
    /// Worker used when nothing else matches.
    pub default_worker: Option<WorkerId>,
}

/// A ready task with its score and avoidance verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub task_id: TaskId,
    pub score: f64,
    pub avoid: Option<AvoidReason>,
}

/// Ordered candidates plus the tasks that failed validation.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub candidates: Vec<Candidate>,
    pub invalid: Vec<(TaskId, String)>,
}

/// Result of `select_next_task`.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Task {
        task_id: TaskId,
        score: f64,
        /// Set when every candidate was flagged and this one was picked anyway.
        avoided: Option<AvoidReason>,
    },
    /// Only invalid tasks are ready; they need a human to fix them.
    NeedsIntervention { invalid: Vec<(TaskId, String)> },
    /// Nothing is ready.
    Idle,
}

/// Which step of the resolution chain picked the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Pinned,
    HumanRequired,
    DomainDefault,
    CapabilityRanked,
    Fallback,
}

impl std::fmt::Display for RouteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteSource::Pinned => write!(f, "pinned"),
            RouteSource::HumanRequired => write!(f, "human_required"),
            RouteSource::DomainDefault => write!(f, "domain_default"),
            RouteSource::CapabilityRanked => write!(f, "capability_ranked"),
            RouteSource::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: TaskId,
    /// `None` when the task needs a human or no worker matched.
    pub worker_id: Option<WorkerId>,
    pub source: RouteSource,
    pub confidence: f64,
    pub reasoning: String,
    pub alternatives: Vec<WorkerId>,
}

impl RoutingDecision {
    pub fn requires_human(&self) -> bool {
        self.source == RouteSource::HumanRequired
    }
}

#[derive(Debug, Clone)]
pub struct TaskRouter {
    scorer: TaskScorer,
    table: RoutingTable,
    human_failure_threshold: u32,
}

impl TaskRouter {
    /// # Arguments
    ///
    /// * `scorer` - Scorer used to rank candidates
    /// * `table` - Domain defaults and the fallback worker
    /// * `human_failure_threshold` - Failed attempts after which a task
    ///   is routed to a human
    pub fn new(scorer: TaskScorer, table: RoutingTable, human_failure_threshold: u32) -> Self {
        Self {
            scorer,
            table,
            human_failure_threshold,
        }
    }

    pub fn scorer(&self) -> &TaskScorer {
        &self.scorer
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Structural checks a task must pass before it can be routed.
    pub fn validate_task(&self, task: &Task, workers: &[Worker]) -> Result<(), String> {
        if task.id.as_str().trim().is_empty() {
            return Err("task id is empty".to_string());
        }
        if task.title.trim().is_empty() {
            return Err(format!("task {} has an empty title", task.id));
        }
        if task.depends_on.contains(&task.id) {
            return Err(format!("task {} depends on itself", task.id));
        }
        if task.domain.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(format!("task {} has an empty domain", task.id));
        }
        if let Some(pinned) = &task.agent {
            if !workers.iter().any(|w| &w.id == pinned) {
                return Err(format!(
                    "task {} is pinned to unregistered worker {}",
                    task.id, pinned
                ));
            }
        }
        Ok(())
    }

    /// Score and order ready tasks.
    ///
    /// Safe candidates come first, then avoided ones; each group by score
    /// descending, ties by id ascending.
    pub fn rank_candidates(
        &self,
        tasks: &[&Task],
        ctx: &ExecutionContext,
        workers: &[Worker],
    ) -> Ranking {
        let mut ranking = Ranking::default();
        for task in tasks {
            if let Err(reason) = self.validate_task(task, workers) {
                tracing::warn!(task = %task.id, %reason, "task failed validation");
                ranking.invalid.push((task.id.clone(), reason));
                continue;
            }
            ranking.candidates.push(Candidate {
                task_id: task.id.clone(),
                score: self.scorer.score(task, ctx, workers),
                avoid: self.scorer.should_avoid(task, ctx, workers),
            });
        }

        ranking.candidates.sort_by(|a, b| {
            a.avoid
                .is_some()
                .cmp(&b.avoid.is_some())
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        ranking.invalid.sort_by(|a, b| a.0.cmp(&b.0));
        ranking
    }

    /// Pick the best ready task.
    pub fn select_next_task(
        &self,
        graph: &DependencyGraph,
        ctx: &ExecutionContext,
        workers: &[Worker],
    ) -> Selection {
        let ready: Vec<&Task> = graph
            .tasks()
            .filter(|t| t.can_start())
            .filter(|t| t.depends_on.iter().all(|d| ctx.is_completed(d)))
            .collect();
        if ready.is_empty() {
            return Selection::Idle;
        }

        let ranking = self.rank_candidates(&ready, ctx, workers);
        match ranking.candidates.into_iter().next() {
            Some(best) => {
                if let Some(reason) = &best.avoid {
                    tracing::info!(
                        task = %best.task_id,
                        %reason,
                        "all candidates flagged for avoidance, proceeding with best"
                    );
                }
                Selection::Task {
                    task_id: best.task_id,
                    score: best.score,
                    avoided: best.avoid,
                }
            }
            None => Selection::NeedsIntervention {
                invalid: ranking.invalid,
            },
        }
    }

    /// Whether a task must go to a human instead of a worker.
    pub fn requires_human(&self, task: &Task) -> Option<String> {
        if task.complexity == Complexity::Complex {
            return Some("complex task requires human review".to_string());
        }
        if task.priority == Priority::Critical && !task.auto_approved {
            return Some("critical task without auto-approval".to_string());
        }
        let failures = task.failure_count();
        if failures >= self.human_failure_threshold {
            return Some(format!("task failed {} times", failures));
        }
        None
    }

    /// Resolve the worker for a task.
    pub fn route_to_agent(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        workers: &[Worker],
    ) -> RoutingDecision {
        let score = self.scorer.score(task, ctx, workers);
        let domain = task.domain.as_deref();
        let find = |id: &WorkerId| workers.iter().find(|w| &w.id == id);

        let capable = rank_capable(workers, domain, task.complexity);

        let (worker, source, reasoning) = if let Some(pinned) = &task.agent {
            (
                find(pinned),
                RouteSource::Pinned,
                format!("pinned to {}", pinned),
            )
        } else if let Some(reason) = self.requires_human(task) {
            return RoutingDecision {
                task_id: task.id.clone(),
                worker_id: None,
                source: RouteSource::HumanRequired,
                confidence: 0.0,
                reasoning: reason,
                alternatives: Vec::new(),
            };
        } else if let Some(w) = domain
            .and_then(|d| self.table.domain_defaults.get(d))
            .and_then(find)
            .filter(|w| w.is_available())
        {
            (
                Some(w),
                RouteSource::DomainDefault,
                format!("default worker for domain {}", domain.unwrap_or_default()),
            )
        } else if !capable.is_empty() {
            let best = capable
                .iter()
                .find(|w| w.is_available())
                .or_else(|| capable.first());
            let reasoning = match best {
                Some(w) => format!(
                    "best of {} capable workers (success rate {:.2})",
                    capable.len(),
                    w.success_rate
                ),
                None => String::new(),
            };
            (
                best.and_then(|w| find(&w.id)),
                RouteSource::CapabilityRanked,
                reasoning,
            )
        } else {
            let fallback = self.table.default_worker.as_ref().and_then(find);
            let reasoning = match fallback {
                Some(w) => format!("no capable worker, falling back to {}", w.id),
                None => "no capable worker and no default configured".to_string(),
            };
            (fallback, RouteSource::Fallback, reasoning)
        };

        let confidence = match worker {
            Some(w) => {
                let domain_match = if w.handles_domain(domain) { 1.0 } else { 0.0 };
                (score + w.success_rate + domain_match) / 3.0
            }
            None => 0.0,
        };
        let alternatives = capable
            .iter()
            .filter(|c| worker.map_or(true, |w| w.id != c.id))
            .take(MAX_ALTERNATIVES)
            .map(|c| c.id.clone())
            .collect();

        let decision = RoutingDecision {
            task_id: task.id.clone(),
            worker_id: worker.map(|w| w.id.clone()),
            source,
            confidence,
            reasoning,
            alternatives,
        };
        tracing::debug!(
            task = %decision.task_id,
            worker = ?decision.worker_id,
            source = %decision.source,
            confidence = decision.confidence,
            "routed task"
        );
        decision
    }
}
