//! Parallel execution correctness tests.
//!
//! These tests verify wave sizing, the one-task-per-worker rule and that
//! routing respects domains, pins and worker status.

use std::time::Duration;

use autopilot::core::task::TaskId;
use autopilot::core::worker::{WorkerId, WorkerStatus};
use autopilot::orchestration::WorkflowState;
use autopilot::OrchestratorConfig;

use crate::fixtures::{
    add_specialist, chain_tasks, generalists, independent_tasks, orchestrator, test_config,
    test_task, ScriptedCall,
};

fn wave_sizes(report: &autopilot::WorkflowReport) -> Vec<usize> {
    report.waves.iter().map(|w| w.dispatched.len()).collect()
}

/// Test: Wave sizing
/// Given 10 independent tasks, 5 workers and max_concurrent_workers = 3
/// When the workflow runs
/// Then waves are 3, 3, 3, 1 and never more than 3 calls overlap
#[tokio::test]
async fn test_ten_tasks_capped_at_three() {
    let call = ScriptedCall::new().with_delay(Duration::from_millis(10));
    let config = OrchestratorConfig {
        max_concurrent_workers: 3,
        ..test_config()
    };
    let orchestrator = orchestrator(config, generalists(&["w1", "w2", "w3", "w4", "w5"]), &call);

    let report = orchestrator.run(independent_tasks(10)).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(wave_sizes(&report), vec![3, 3, 3, 1]);
    assert_eq!(call.max_in_flight(), 3);
    assert_eq!(call.call_count(), 10);
}

/// Test: Concurrency cap
/// Given 4 workers but max_concurrent_workers = 2
/// When 4 independent tasks run
/// Then each wave dispatches 2
#[tokio::test]
async fn test_concurrency_cap_below_worker_count() {
    let call = ScriptedCall::new().with_delay(Duration::from_millis(5));
    let config = OrchestratorConfig {
        max_concurrent_workers: 2,
        ..test_config()
    };
    let orchestrator = orchestrator(config, generalists(&["w1", "w2", "w3", "w4"]), &call);

    let report = orchestrator.run(independent_tasks(4)).await.unwrap();

    assert_eq!(wave_sizes(&report), vec![2, 2]);
    assert!(call.max_in_flight() <= 2);
}

/// Test: Distinct workers per wave
/// Given 6 independent tasks and 3 workers
/// When the workflow runs
/// Then no worker appears twice in the same wave
#[tokio::test]
async fn test_no_worker_runs_two_tasks_in_one_wave() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2", "w3"]), &call);

    let report = orchestrator.run(independent_tasks(6)).await.unwrap();

    let calls = call.calls();
    let mut offset = 0;
    for wave in &report.waves {
        let workers: std::collections::HashSet<&WorkerId> = calls[offset..offset + wave.dispatched.len()]
            .iter()
            .map(|(w, _)| w)
            .collect();
        assert_eq!(workers.len(), wave.dispatched.len());
        offset += wave.dispatched.len();
    }
}

/// Test: Chains serialize
/// Given a 4-task chain and 3 workers
/// When the workflow runs
/// Then every wave carries exactly one task
#[tokio::test]
async fn test_chain_runs_one_task_per_wave() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2", "w3"]), &call);

    let report = orchestrator.run(chain_tasks(4)).await.unwrap();

    assert_eq!(wave_sizes(&report), vec![1, 1, 1, 1]);
    assert_eq!(call.task_order(), vec!["c0", "c1", "c2", "c3"]);
}

/// Test: Domain routing
/// Given one database and one frontend specialist
/// When tasks from both domains run
/// Then each task lands on its domain's worker
#[tokio::test]
async fn test_tasks_route_to_domain_specialists() {
    let call = ScriptedCall::new();
    let registry = generalists(&[]);
    add_specialist(&registry, "dba", "db");
    add_specialist(&registry, "fe", "ui");
    let orchestrator = orchestrator(test_config(), registry, &call);

    let report = orchestrator
        .run(vec![
            test_task("schema").with_domain("db"),
            test_task("index").with_domain("db"),
            test_task("page").with_domain("ui"),
        ])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(report.waves.len(), 2);
    for (worker, task) in call.calls() {
        let expected = if task.as_str() == "page" { "fe" } else { "dba" };
        assert_eq!(worker.as_str(), expected, "task {} ran on {}", task, worker);
    }
}

/// Test: Pinned tasks
/// Given two tasks pinned to w1 and a second idle worker
/// When the workflow runs
/// Then both pinned tasks run on w1 in different waves
#[tokio::test]
async fn test_pinned_tasks_wait_for_their_worker() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator
        .run(vec![
            test_task("p1").pinned_to("w1"),
            test_task("p2").pinned_to("w1"),
            test_task("free"),
        ])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    for (worker, task) in call.calls() {
        if task.as_str().starts_with('p') {
            assert_eq!(worker, WorkerId::from("w1"));
        }
    }
    let pinned = [TaskId::from("p1"), TaskId::from("p2")];
    for wave in &report.waves {
        let count = wave.dispatched.iter().filter(|t| pinned.contains(t)).count();
        assert!(count <= 1, "wave {} ran both pinned tasks", wave.wave);
    }
}

/// Test: Worker status
/// Given a rate-limited worker and an available one
/// When tasks run
/// Then only the available worker is called
#[tokio::test]
async fn test_rate_limited_worker_is_skipped() {
    let call = ScriptedCall::new();
    let registry = generalists(&["w1", "w2"]);
    registry
        .set_status(&WorkerId::from("w2"), WorkerStatus::RateLimited)
        .unwrap();
    let orchestrator = orchestrator(test_config(), registry, &call);

    let report = orchestrator.run(independent_tasks(3)).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(wave_sizes(&report), vec![1, 1, 1]);
    assert!(call.calls().iter().all(|(w, _)| w.as_str() == "w1"));
}
