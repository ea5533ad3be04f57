//! End-to-end workflow tests.
//!
//! These tests submit whole task sets and check ordering, the final
//! report and the handle's control surface.

use std::sync::Arc;
use std::time::Duration;

use autopilot::core::task::TaskId;
use autopilot::orchestration::{Orchestrator, OrchestratorEvent, StaticProbe, WorkflowState};
use autopilot::{Error, ManualClock};

use crate::fixtures::{
    default_config, diamond_tasks, generalists, orchestrator, six_task_diamond, test_config,
    test_task, ScriptedCall,
};

fn position(order: &[String], id: &str) -> usize {
    order
        .iter()
        .position(|t| t == id)
        .unwrap_or_else(|| panic!("{} never ran", id))
}

/// Test: Diamond workflow
/// Given a diamond a -> (b, c) -> d and two workers
/// When the workflow runs
/// Then tasks run in dependency order across three waves
#[tokio::test]
async fn test_diamond_workflow_runs_in_dependency_order() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator.run(diamond_tasks()).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert!(report.is_success());
    assert_eq!(report.completed.len(), 4);

    let order = call.task_order();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));

    let waves: Vec<Vec<&str>> = report
        .waves
        .iter()
        .map(|w| w.dispatched.iter().map(|t| t.as_str()).collect())
        .collect();
    assert_eq!(waves.len(), 3);
    assert_eq!(waves[0], vec!["a"]);
    assert_eq!(waves[1].len(), 2);
    assert_eq!(waves[2], vec!["d"]);
}

/// Test: Six-task diamond
/// Given a -> (b, c) -> d -> (e, f) and two workers
/// When the workflow runs
/// Then b and c both finish before d starts and e, f share the last wave
#[tokio::test]
async fn test_six_task_diamond_waves() {
    let call = ScriptedCall::new().with_delay(Duration::from_millis(5));
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator.run(six_task_diamond()).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    let waves: Vec<Vec<&str>> = report
        .waves
        .iter()
        .map(|w| {
            let mut ids: Vec<&str> = w.dispatched.iter().map(|t| t.as_str()).collect();
            ids.sort();
            ids
        })
        .collect();
    assert_eq!(waves, vec![vec!["a"], vec!["b", "c"], vec!["d"], vec!["e", "f"]]);
    assert_eq!(call.max_in_flight(), 2);

    let order = call.task_order();
    let d = position(&order, "d");
    assert!(position(&order, "b") < d);
    assert!(position(&order, "c") < d);
    assert!(position(&order, "e") > d);
    assert!(position(&order, "f") > d);
}

/// Test: Report contents
/// Given a completed diamond workflow
/// When the report is serialized
/// Then the JSON carries state, decisions and the critical path
#[tokio::test]
async fn test_report_serializes_to_json() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1", "w2"]), &call);

    let report = orchestrator.run(diamond_tasks()).await.unwrap();
    let json = report.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["state"], "completed");
    assert_eq!(value["decisions"].as_array().map(Vec::len), Some(4));
    assert_eq!(value["critical_path"].as_array().map(Vec::len), Some(3));
    assert_eq!(report.critical_path.first(), Some(&TaskId::from("a")));
    assert_eq!(report.critical_path.last(), Some(&TaskId::from("d")));
    assert!(report
        .decisions
        .iter()
        .all(|entry| entry.decision.worker_id.is_some()));
}

/// Test: Background submission
/// Given a submitted task set
/// When events are drained and the handle awaited
/// Then every task produced a start and completion event
#[tokio::test]
async fn test_submit_streams_events() {
    let call = ScriptedCall::new();
    let orchestrator = Arc::new(orchestrator(test_config(), generalists(&["w1", "w2"]), &call));

    let mut handle = orchestrator.submit_task_set(diamond_tasks()).unwrap();

    let mut started = 0;
    let mut completed = 0;
    let mut final_state = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), handle.events().recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        match event {
            OrchestratorEvent::TaskStarted { .. } => started += 1,
            OrchestratorEvent::TaskCompleted { .. } => completed += 1,
            OrchestratorEvent::AllTasksComplete { state } => {
                final_state = Some(state);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(started, 4);
    assert_eq!(completed, 4);
    assert_eq!(final_state, Some(WorkflowState::Completed));

    let id = handle.id();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.id, id);
}

/// Test: Status snapshot
/// Given a finished background workflow
/// When its status is read
/// Then counts reflect the terminal state
#[tokio::test]
async fn test_status_after_completion() {
    let call = ScriptedCall::new();
    let orchestrator = Arc::new(orchestrator(test_config(), generalists(&["w1"]), &call));

    let mut handle = orchestrator
        .submit_task_set(vec![test_task("x"), test_task("y").depends_on("x")])
        .unwrap();
    while !matches!(
        handle.events().recv().await,
        Ok(OrchestratorEvent::AllTasksComplete { .. }) | Err(_)
    ) {}
    // The run flips its state right after the final event.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = handle.status().await;
    assert_eq!(status.total, 2);
    assert_eq!(status.completed, 2);
    assert_eq!(status.waves, 2);
    assert_eq!(status.remaining_critical_path, 0);
    assert_eq!(status.state, WorkflowState::Completed);
    handle.wait().await.unwrap();
}

/// Test: Cancellation
/// Given a worker call that never answers in time
/// When the workflow is cancelled mid-wave
/// Then the report says Cancelled and nothing completed
#[tokio::test]
async fn test_cancel_stops_workflow() {
    let call = ScriptedCall::new().with_delay(Duration::from_secs(3));
    let orchestrator = Arc::new(orchestrator(test_config(), generalists(&["w1"]), &call));

    let mut handle = orchestrator
        .submit_task_set(vec![test_task("slow"), test_task("next").depends_on("slow")])
        .unwrap();
    loop {
        if let Ok(OrchestratorEvent::TaskStarted { .. }) = handle.events().recv().await {
            break;
        }
    }
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("cancel is prompt")
        .unwrap();
    assert_eq!(report.state, WorkflowState::Cancelled);
    assert!(report.completed.is_empty());
    assert_eq!(call.call_count(), 1);
}

/// Test: Cancelled calls are forgotten
/// Given a workflow cancelled while its only call is in flight
/// When the stuck-task timeout passes and a second workflow runs
/// Then nothing is left tracked and the second workflow completes
#[tokio::test]
async fn test_cancelled_run_leaves_next_run_healthy() {
    let clock = Arc::new(ManualClock::default());
    let call = ScriptedCall::new().with_delay(Duration::from_millis(200));
    let orchestrator = Arc::new(
        Orchestrator::with_environment(
            default_config(),
            generalists(&["w1"]),
            Arc::new(call.clone()),
            clock.clone(),
            Arc::new(StaticProbe::default()),
        )
        .unwrap(),
    );

    let mut handle = orchestrator.submit_task_set(vec![test_task("slow")]).unwrap();
    loop {
        if let Ok(OrchestratorEvent::TaskStarted { .. }) = handle.events().recv().await {
            break;
        }
    }
    handle.cancel();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.state, WorkflowState::Cancelled);
    assert_eq!(orchestrator.failsafe().tracked_tasks(), 0);

    clock.advance(Duration::from_secs(601));
    let report = orchestrator.run(vec![test_task("fresh")]).await.unwrap();

    assert_eq!(report.state, WorkflowState::Completed);
    assert_eq!(call.task_order(), vec!["slow", "fresh"]);
    assert!(orchestrator.failsafe().check_all().is_empty());
}

/// Test: Invalid graphs
/// Given a task set with a cycle
/// When it is submitted
/// Then submission fails with the tasks on the cycle
#[tokio::test]
async fn test_cycle_rejected_at_submit() {
    let call = ScriptedCall::new();
    let orchestrator = Arc::new(orchestrator(test_config(), generalists(&["w1"]), &call));

    let result = orchestrator.submit_task_set(vec![
        test_task("a").depends_on("b"),
        test_task("b").depends_on("a"),
        test_task("c"),
    ]);

    match result {
        Err(Error::CycleDetected { remaining }) => {
            assert_eq!(remaining, vec![TaskId::from("a"), TaskId::from("b")]);
        }
        other => panic!("expected cycle error, got {:?}", other.map(|h| h.id())),
    }
    assert_eq!(call.call_count(), 0);
}

/// Test: Unknown dependency
#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let call = ScriptedCall::new();
    let orchestrator = orchestrator(test_config(), generalists(&["w1"]), &call);

    let result = orchestrator
        .run(vec![test_task("a").depends_on("ghost")])
        .await;

    assert!(matches!(result, Err(Error::Validation(_))));
}
