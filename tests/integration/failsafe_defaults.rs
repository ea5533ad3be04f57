//! Whole workflows under the default failsafe thresholds.
//!
//! The other suites relax the error-rate and confidence checks so each
//! test only halts on what it sets up. These run with the shipped
//! defaults and check that ordinary trouble in one task never stops
//! unrelated work.

use autopilot::core::task::{Complexity, TaskId};
use autopilot::core::worker::WorkerId;
use autopilot::orchestration::{CapabilityRegistry, SupervisorState, WorkflowState};
use std::sync::Arc;

use crate::fixtures::{
    default_config, generalists, orchestrator, six_task_diamond, test_task, ScriptedCall,
};

/// Test: Healthy workflow
/// Given the six-task diamond and default thresholds
/// When the workflow runs
/// Then it completes without any worker being paused
#[tokio::test]
async fn test_diamond_completes_at_defaults() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(default_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator.run(six_task_diamond()).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(report.completed.len(), 6);
    assert!(report.waves.iter().all(|w| w.deferred == 0));
    assert!(orchestrator.supervisor().paused_workers().is_empty());
}

/// Test: One doubtful routing decision
/// Given a ui task pinned to a weak database worker and an unrelated task
/// When the workflow runs at the default confidence floor
/// Then the doubtful task goes to a human and the other one completes
#[tokio::test]
async fn test_low_confidence_task_does_not_halt_others() {
    let call = ScriptedCall::new();
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register("w0", ["db"], Complexity::Moderate, 0.1);
    registry.register("w1", Vec::<String>::new(), Complexity::Moderate, 0.9);
    let orchestrator = orchestrator(default_config(), registry, &call);

    let report = orchestrator
        .run(vec![
            test_task("odd").with_domain("ui").pinned_to("w0"),
            test_task("ok"),
        ])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::CompletedWithFailures);
    assert_eq!(report.completed, vec![TaskId::from("ok")]);
    assert_eq!(report.blocked[0].task_id, TaskId::from("odd"));
    assert!(report.blocked[0].reason.contains("below 0.30"));
    assert_eq!(call.task_order(), vec!["ok"]);
    for worker in ["w0", "w1"] {
        assert_eq!(
            orchestrator.supervisor().state(&WorkerId::from(worker)),
            SupervisorState::Running
        );
    }
}

/// Test: Failing tasks next to fresh work
/// Given two tasks that always fail and two that succeed, on two workers
/// When the error rate crosses the default threshold and pauses the workers
/// Then the fresh tasks have already run, the pause cools down and the
/// failing tasks run out their retries instead of the workflow sticking
#[tokio::test]
async fn test_failing_tasks_do_not_starve_fresh_work() {
    let call = ScriptedCall::new().fail_always("f1").fail_always("f2");
    let orchestrator = orchestrator(default_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator
        .run(vec![
            test_task("f1"),
            test_task("f2"),
            test_task("ok"),
            test_task("x0"),
        ])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::CompletedWithFailures);
    let mut completed: Vec<&str> = report.completed.iter().map(|t| t.as_str()).collect();
    completed.sort();
    assert_eq!(completed, vec!["ok", "x0"]);
    let mut failed: Vec<&str> = report.failed.iter().map(|f| f.task_id.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["f1", "f2"]);
    assert!(report.escalations.is_empty());

    // Every fresh task ran before the first retry
    let order = call.task_order();
    let first_retry = order
        .iter()
        .enumerate()
        .filter(|(_, t)| t.starts_with('f'))
        .nth(2)
        .map(|(i, _)| i)
        .expect("failing tasks were retried");
    for fresh in ["ok", "x0"] {
        let at = order.iter().position(|t| t == fresh).expect("fresh task ran");
        assert!(at < first_retry, "{} ran after a retry: {:?}", fresh, order);
    }
}

/// Test: Transient failure at defaults
/// Given one task that fails once among healthy ones
/// When the workflow runs
/// Then the retry succeeds and no failsafe condition is left behind
#[tokio::test]
async fn test_transient_failure_recovers_at_defaults() {
    let call = ScriptedCall::new().fail("t01", 1);
    let orchestrator = orchestrator(default_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator
        .run(vec![test_task("t00"), test_task("t01"), test_task("t02")])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(call.call_count(), 4);
    assert!(orchestrator.failsafe().check_all().is_empty());
}
