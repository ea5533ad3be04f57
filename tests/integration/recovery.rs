//! Retry, breaker and failsafe integration tests.
//!
//! These tests verify that failures are retried up to their limit, that
//! downstream work is blocked when a task gives up, and that the breaker
//! and failsafe monitor halt workers the way a stuck or failing
//! environment demands.

use std::sync::Arc;
use std::time::Duration;

use autopilot::core::task::{Priority, TaskId};
use autopilot::core::worker::WorkerId;
use autopilot::orchestration::{
    BreakerState, Orchestrator, OrchestratorEvent, ResourceUsage, RoutingTable, Severity,
    StaticProbe, SupervisorState, WorkflowState,
};
use autopilot::{Error, OrchestratorConfig, SystemClock};

use crate::fixtures::{
    add_specialist, generalists, orchestrator, test_config, test_task, ScriptedCall,
};

/// Test: Transient failure
/// Given a task that fails once
/// When the workflow runs
/// Then it is retried and completes
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let call = ScriptedCall::new().fail("flaky", 1);
    let orchestrator = orchestrator(test_config(), generalists(&["w1"]), &call);
    let mut events = orchestrator.subscribe();

    let report = orchestrator.run(vec![test_task("flaky")]).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(call.call_count(), 2);
    assert_eq!(report.waves[0].failed, 1);

    let mut retried = false;
    while let Ok(event) = events.try_recv() {
        if let OrchestratorEvent::TaskFailed { will_retry, .. } = event {
            retried |= will_retry;
        }
    }
    assert!(retried);
}

/// Test: Exhausted retries
/// Given a root task that always fails and a chain depending on it
/// When the workflow runs
/// Then the root fails after max_retries + 1 attempts, its dependents
/// are blocked and unrelated work still completes
#[tokio::test]
async fn test_exhausted_retries_block_dependents() {
    let call = ScriptedCall::new().fail_always("root");
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator
        .run(vec![
            test_task("root"),
            test_task("mid").depends_on("root"),
            test_task("leaf").depends_on("mid"),
            test_task("side"),
        ])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::CompletedWithFailures);
    assert_eq!(report.completed, vec![TaskId::from("side")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, TaskId::from("root"));
    assert!(report.failed[0].reason.contains("scripted failure"));

    let blocked: Vec<&str> = report.blocked.iter().map(|b| b.task_id.as_str()).collect();
    assert_eq!(blocked, vec!["mid", "leaf"]);

    let root_attempts = call
        .calls()
        .iter()
        .filter(|(_, t)| t.as_str() == "root")
        .count();
    assert_eq!(root_attempts, 3);
}

/// Test: Human routing
/// Given a critical task without auto-approval
/// When the workflow runs
/// Then it is never dispatched and ends Blocked
#[tokio::test]
async fn test_critical_task_goes_to_human() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1"]), &call);

    let report = orchestrator
        .run(vec![
            test_task("deploy").with_priority(Priority::Critical),
            test_task("approved")
                .with_priority(Priority::Critical)
                .auto_approved(),
        ])
        .await
        .unwrap();

    assert_eq!(report.completed, vec![TaskId::from("approved")]);
    assert_eq!(report.blocked.len(), 1);
    assert!(report.blocked[0].reason.contains("auto-approval"));
    assert!(call.calls().iter().all(|(_, t)| t.as_str() != "deploy"));
}

/// Test: No capable worker
/// Given a ui task and only a database specialist
/// When the workflow runs
/// Then it fails as stuck with a dump naming the task
#[tokio::test]
async fn test_no_capable_worker_is_stuck() {
    let call = ScriptedCall::new();
    let registry = generalists(&[]);
    add_specialist(&registry, "dba", "db");
    let orchestrator = orchestrator(test_config(), registry, &call);

    let result = orchestrator
        .run(vec![test_task("ui-task").with_domain("ui")])
        .await;

    match result {
        Err(Error::StuckWorkflow { dump }) => {
            assert!(dump.contains("ui-task"));
            assert!(dump.contains("dba"));
        }
        other => panic!("expected stuck workflow, got {:?}", other.map(|r| r.state)),
    }
    assert_eq!(call.call_count(), 0);
}

/// Test: Fallback worker
/// Given no specialist for the task's domain but a configured default
/// When the workflow runs
/// Then the default worker takes the task
#[tokio::test]
async fn test_default_worker_takes_unmatched_task() {
    let call = ScriptedCall::new();
    let registry = generalists(&[]);
    add_specialist(&registry, "dba", "db");
    let config = OrchestratorConfig {
        routing: RoutingTable {
            default_worker: Some(WorkerId::from("dba")),
            ..Default::default()
        },
        ..test_config()
    };
    let orchestrator = orchestrator(config, registry, &call);

    let report = orchestrator
        .run(vec![test_task("ui-task").with_domain("ui")])
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(call.calls()[0].0, WorkerId::from("dba"));
}

/// Test: Breaker opens
/// Given a breaker threshold of 2 and a task that always fails
/// When the workflow runs
/// Then the breaker opens, the worker is paused and the workflow ends stuck
#[tokio::test]
async fn test_open_breaker_pauses_worker() {
    let call = ScriptedCall::new().fail_always("flaky");
    let config = OrchestratorConfig {
        breaker_failure_threshold: 2,
        breaker_timeout: Duration::from_secs(60),
        max_retries: 5,
        human_failure_threshold: 10,
        ..test_config()
    };
    let orchestrator = orchestrator(config, generalists(&["w1"]), &call);
    let w1 = WorkerId::from("w1");

    let result = orchestrator.run(vec![test_task("flaky")]).await;

    assert!(matches!(result, Err(Error::StuckWorkflow { .. })));
    assert_eq!(call.call_count(), 2);
    assert_eq!(
        orchestrator.supervisor().breakers().state(&w1),
        Some(BreakerState::Open)
    );
    assert_eq!(orchestrator.supervisor().state(&w1), SupervisorState::Paused);
}

/// Test: Consecutive errors
/// Given a consecutive-error limit of 2 and a task that always fails
/// When two attempts fail back to back
/// Then the monitor pauses the worker, the pause cools down, the worker
/// comes back through Recovering and the task runs out its retries
#[tokio::test]
async fn test_consecutive_errors_pause_then_recover() {
    let call = ScriptedCall::new().fail_always("flaky");
    let config = OrchestratorConfig {
        consecutive_error_threshold: 2,
        breaker_failure_threshold: 10,
        max_retries: 3,
        human_failure_threshold: 10,
        ..test_config()
    };
    let orchestrator = orchestrator(config, generalists(&["w1"]), &call);

    let report = orchestrator.run(vec![test_task("flaky")]).await.unwrap();

    assert_eq!(report.state, WorkflowState::CompletedWithFailures);
    assert_eq!(report.failed[0].task_id, TaskId::from("flaky"));
    assert_eq!(call.call_count(), 4);
    assert!(report.waves.iter().any(|w| w.deferred == 1));
    assert!(orchestrator.supervisor().supervision(&WorkerId::from("w1")).recovery_attempts >= 1);
}

/// Test: Resource escalation
/// Given CPU usage above the critical threshold
/// When the workflow runs
/// Then the worker is escalated, nothing runs and the workflow stalls;
/// after the pressure clears and the worker is unblocked a new run succeeds
#[tokio::test]
async fn test_critical_resource_pressure_escalates() {
    let call = ScriptedCall::new();
    let probe = Arc::new(StaticProbe::new(ResourceUsage {
        cpu: 99.5,
        ..Default::default()
    }));
    let orchestrator = Orchestrator::with_environment(
        test_config(),
        generalists(&["w1"]),
        Arc::new(call.clone()),
        Arc::new(SystemClock),
        probe.clone(),
    )
    .unwrap();
    let mut events = orchestrator.subscribe();
    let w1 = WorkerId::from("w1");

    let report = orchestrator.run(vec![test_task("job")]).await.unwrap();

    assert_eq!(report.state, WorkflowState::Stalled);
    assert_eq!(call.call_count(), 0);
    assert_eq!(report.escalations.len(), 1);
    assert_eq!(report.escalations[0].worker_id, w1);
    assert!(!report.escalations[0].stale);

    let mut escalated = None;
    while let Ok(event) = events.try_recv() {
        if let OrchestratorEvent::Escalated { severity, .. } = event {
            escalated = Some(severity);
        }
    }
    assert_eq!(escalated, Some(Severity::Critical));

    // Clear the pressure and resume by hand.
    probe.set(ResourceUsage::default());
    orchestrator.failsafe().refresh().await;
    assert!(orchestrator.supervisor().unblock(&w1));

    let report = orchestrator.run(vec![test_task("job")]).await.unwrap();
    assert_eq!(report.state, WorkflowState::Completed);
    assert!(report.escalations.is_empty());
}

/// Test: Timeouts count as failures
/// Given a call slower than task_timeout
/// When the workflow runs with no retries
/// Then the task fails with a timeout message
#[tokio::test]
async fn test_slow_call_times_out() {
    let call = ScriptedCall::new().with_delay(Duration::from_millis(200));
    let config = OrchestratorConfig {
        task_timeout: Duration::from_millis(20),
        max_retries: 0,
        ..test_config()
    };
    let orchestrator = orchestrator(config, generalists(&["w1"]), &call);

    let report = orchestrator.run(vec![test_task("slow")]).await.unwrap();

    assert_eq!(report.state, WorkflowState::CompletedWithFailures);
    assert!(report.failed[0].reason.contains("timed out"));
}
