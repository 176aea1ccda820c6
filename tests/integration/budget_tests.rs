//! Budget supervision of scripted sessions.

use std::time::Duration;

use agent_conductor::errors::BudgetMetric;
use agent_conductor::models::budget::{Budget, Usage};
use agent_conductor::models::command_queue::{CommandStatus, QueueCommand, SessionMode};
use agent_conductor::models::session_group::{SessionSpec, SpecStatus};
use agent_conductor::orchestrator::budget_guard::{BudgetGuard, SessionReport};
use agent_conductor::orchestrator::launcher::{LaunchRequest, SessionLauncher};
use agent_conductor::orchestrator::queue_executor::QueueRunOptions;
use agent_conductor::orchestrator::scheduler::RunOptions;
use agent_conductor::AppError;

use super::test_helpers::{conductor, Behavior, FakeLauncher};

fn usage(cost_usd: f64, turns: u32) -> Usage {
    Usage { cost_usd, turns }
}

fn cost_cap(limit: f64) -> Budget {
    Budget {
        max_budget_usd: Some(limit),
        max_turns: None,
    }
}

async fn supervise(launcher: &FakeLauncher, prompt: &str, budget: Budget) -> SessionReport {
    let session = launcher
        .start(&LaunchRequest::new("/tmp/project", prompt))
        .await
        .expect("start");
    BudgetGuard::default().supervise(launcher, session, budget).await
}

#[tokio::test]
async fn crossing_cost_ceiling_terminates_session() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script(
        "spender",
        Behavior::Spend(vec![usage(0.5, 1), usage(1.5, 2), usage(3.0, 3)]),
    );

    let report = supervise(&launcher, "spender", cost_cap(1.0)).await;

    match report.outcome {
        Err(AppError::BudgetExceeded {
            session_id,
            metric,
            usage,
            limit,
        }) => {
            assert_eq!(session_id, "sess-1");
            assert_eq!(metric, BudgetMetric::CostUsd);
            assert!((usage - 1.5).abs() < 1e-9);
            assert!((limit - 1.0).abs() < 1e-9);
        }
        other => panic!("expected budget trip, got {other:?}"),
    }
    assert!((report.usage.cost_usd - 1.5).abs() < 1e-9);
    assert_eq!(launcher.terminated(), vec!["sess-1"]);
}

#[tokio::test]
async fn crossing_turn_ceiling_terminates_session() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("chatty", Behavior::Spend(vec![usage(0.0, 1), usage(0.0, 2), usage(0.0, 3)]));
    let budget = Budget {
        max_budget_usd: None,
        max_turns: Some(2),
    };

    let report = supervise(&launcher, "chatty", budget).await;

    assert!(matches!(
        report.outcome,
        Err(AppError::BudgetExceeded {
            metric: BudgetMetric::Turns,
            ..
        })
    ));
    assert_eq!(report.usage.turns, 3);
    assert_eq!(launcher.terminated().len(), 1);
}

#[tokio::test]
async fn usage_at_ceiling_is_allowed() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("exact", Behavior::Spend(vec![usage(0.4, 1), usage(1.0, 2)]));

    let report = supervise(&launcher, "exact", cost_cap(1.0)).await;

    assert!(report.succeeded());
    assert!((report.usage.cost_usd - 1.0).abs() < 1e-9);
    assert!(launcher.terminated().is_empty());
}

#[tokio::test]
async fn failed_exit_keeps_reported_usage() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("broken", Behavior::Fail);

    let report = supervise(&launcher, "broken", Budget::unbounded()).await;

    assert!(matches!(
        report.outcome,
        Err(AppError::Process {
            exit_code: Some(1),
            ..
        })
    ));
    assert!((report.usage.cost_usd - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn spec_budget_trip_fails_spec_and_skips_dependents() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("costly", Behavior::Spend(vec![usage(0.2, 1), usage(2.0, 2)]));
    let (_dir, conductor) = conductor(&launcher);
    let groups = conductor.groups();

    let group = groups
        .create_group(
            "capped",
            Some(1),
            vec![
                SessionSpec::new("a", "/tmp/project", "costly").with_budget(cost_cap(1.0)),
                SessionSpec::new("b", "/tmp/project", "after").depends_on(["a"]),
            ],
        )
        .await
        .expect("create");
    groups
        .run(&group.id, RunOptions::default())
        .await
        .expect("run");
    let done = groups.wait(&group.id).await.expect("wait");

    let a = done.spec("a").expect("a");
    assert_eq!(a.status, SpecStatus::Failed);
    assert!(a.error.as_deref().is_some_and(|e| e.starts_with("budget exceeded")));
    assert!((a.cost_usd - 2.0).abs() < 1e-9);
    assert_eq!(done.spec("b").expect("b").status, SpecStatus::Skipped);
    assert_eq!(launcher.terminated(), vec!["sess-1"]);
}

#[tokio::test]
async fn command_budget_trip_applies_failure_policy() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("costly", Behavior::Spend(vec![usage(5.0, 1)]));
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let mut capped = QueueCommand::new("costly", SessionMode::New);
    capped.budget = Some(cost_cap(1.0));
    let queue = queues
        .create_queue(
            "capped",
            "/tmp/project",
            vec![capped, QueueCommand::new("next", SessionMode::New)],
        )
        .await
        .expect("create");
    queues
        .run(
            &queue.id,
            QueueRunOptions {
                stop_on_failure: true,
            },
        )
        .await
        .expect("run");
    let done = queues.wait(&queue.id).await.expect("wait");

    assert_eq!(done.commands[0].status, CommandStatus::Failed);
    assert_eq!(done.commands[1].status, CommandStatus::Skipped);
    assert_eq!(launcher.prompts(), vec!["costly"]);
}
