//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A relaxed orchestrator config that only halts on what a test sets up
//! - The default config with test-sized waits
//! - Worker registries
//! - A scripted worker call that records what ran where
//! - Predefined task sets

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autopilot::core::task::{Complexity, Task, TaskId};
use autopilot::core::worker::WorkerId;
use autopilot::orchestration::{CapabilityRegistry, Orchestrator, WorkerCall};
use autopilot::OrchestratorConfig;
use futures::future::BoxFuture;

/// Config with the error-rate and confidence checks out of the way and
/// short stall backoff.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        error_rate_threshold: 1.0,
        consecutive_error_threshold: 0,
        min_confidence: 0.0,
        stall_backoff: Duration::from_millis(10),
        max_stalled_passes: 2,
        task_timeout: Duration::from_secs(5),
        pause_cooldown: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Default thresholds throughout; only the waits are shortened.
pub fn default_config() -> OrchestratorConfig {
    OrchestratorConfig {
        stall_backoff: Duration::from_millis(10),
        task_timeout: Duration::from_secs(5),
        pause_cooldown: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Registry of workers that accept any domain.
pub fn generalists(ids: &[&str]) -> Arc<CapabilityRegistry> {
    let registry = Arc::new(CapabilityRegistry::new());
    for id in ids {
        registry.register(*id, Vec::<String>::new(), Complexity::Moderate, 0.9);
    }
    registry
}

/// Register a worker limited to one domain.
pub fn add_specialist(registry: &CapabilityRegistry, id: &str, domain: &str) {
    registry.register(id, [domain], Complexity::Moderate, 0.9);
}

pub fn orchestrator(
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    call: &ScriptedCall,
) -> Orchestrator {
    Orchestrator::new(config, registry, Arc::new(call.clone())).expect("valid config")
}

#[derive(Debug, Default)]
struct Script {
    /// Failures left per task; `u32::MAX` fails forever.
    failures: Mutex<HashMap<TaskId, u32>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<(WorkerId, TaskId)>>,
}

/// Worker call that succeeds unless told otherwise and records every
/// invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCall {
    script: Arc<Script>,
}

impl ScriptedCall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each call sleeps this long before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.script.delay.lock().unwrap() = delay;
        self
    }

    /// Fail the next `times` attempts at `task`.
    pub fn fail(self, task: &str, times: u32) -> Self {
        self.script
            .failures
            .lock()
            .unwrap()
            .insert(TaskId::from(task), times);
        self
    }

    pub fn fail_always(self, task: &str) -> Self {
        self.fail(task, u32::MAX)
    }

    pub fn calls(&self) -> Vec<(WorkerId, TaskId)> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.calls.lock().unwrap().len()
    }

    /// Tasks in the order they were handed to a worker.
    pub fn task_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|(_, t)| t.as_str().to_string())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }
}

impl WorkerCall for ScriptedCall {
    fn call(&self, worker: &WorkerId, task: &Task) -> BoxFuture<'static, Result<String, String>> {
        let script = Arc::clone(&self.script);
        script
            .calls
            .lock()
            .unwrap()
            .push((worker.clone(), task.id.clone()));
        let fail = {
            let mut failures = script.failures.lock().unwrap();
            match failures.get_mut(&task.id) {
                Some(0) | None => false,
                Some(&mut u32::MAX) => true,
                Some(left) => {
                    *left -= 1;
                    true
                }
            }
        };
        let delay = *script.delay.lock().unwrap();
        let task_id = task.id.clone();

        Box::pin(async move {
            let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            script.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            script.in_flight.fetch_sub(1, Ordering::SeqCst);
            if fail {
                Err(format!("scripted failure of {}", task_id))
            } else {
                Ok(format!("{} done", task_id))
            }
        })
    }
}

/// Create a test task with the given id as its title.
pub fn test_task(id: &str) -> Task {
    Task::new(id, &format!("Task {}", id))
}

/// `count` tasks with no dependencies, ids `t00`, `t01`, ...
pub fn independent_tasks(count: usize) -> Vec<Task> {
    (0..count).map(|i| test_task(&format!("t{:02}", i))).collect()
}

/// Diamond graph:
///
/// ```text
///     a
///    / \
///   b   c
///    \ /
///     d
/// ```
pub fn diamond_tasks() -> Vec<Task> {
    vec![
        test_task("a"),
        test_task("b").depends_on("a"),
        test_task("c").depends_on("a"),
        test_task("d").depends_on("b").depends_on("c"),
    ]
}

/// Six-task diamond:
///
/// ```text
///     a
///    / \
///   b   c
///    \ /
///     d
///    / \
///   e   f
/// ```
pub fn six_task_diamond() -> Vec<Task> {
    let mut tasks = diamond_tasks();
    tasks.push(test_task("e").depends_on("d"));
    tasks.push(test_task("f").depends_on("d"));
    tasks
}

/// Chain `c0 -> c1 -> ... -> c{len-1}`.
pub fn chain_tasks(len: usize) -> Vec<Task> {
    (0..len)
        .map(|i| {
            let task = test_task(&format!("c{}", i));
            if i == 0 {
                task
            } else {
                task.depends_on(format!("c{}", i - 1))
            }
        })
        .collect()
}
