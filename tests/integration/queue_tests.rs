//! Command-queue execution against the scripted launcher.

use std::time::Duration;

use agent_conductor::bridge::BridgeMessage;
use agent_conductor::models::activity::ActivityStatus;
use agent_conductor::models::command_queue::{
    CommandEdit, CommandQueue, CommandStatus, QueueCommand, QueueStatus, SessionMode,
};
use agent_conductor::models::transcript::{TranscriptEvent, TranscriptEventKind};
use agent_conductor::orchestrator::queue_executor::QueueRunOptions;
use agent_conductor::AppError;
use serde_json::json;

use super::test_helpers::{conductor, Behavior, FakeLauncher, LaunchRecord};

fn new(prompt: &str) -> QueueCommand {
    QueueCommand::new(prompt, SessionMode::New)
}

fn cont(prompt: &str) -> QueueCommand {
    QueueCommand::new(prompt, SessionMode::Continue)
}

fn statuses(queue: &CommandQueue) -> Vec<CommandStatus> {
    queue.commands.iter().map(|c| c.status).collect()
}

const KEEP_GOING: QueueRunOptions = QueueRunOptions {
    stop_on_failure: false,
};
const STRICT: QueueRunOptions = QueueRunOptions {
    stop_on_failure: true,
};

#[tokio::test]
async fn continued_session_transcript_reaches_subscribers() {
    let launcher = FakeLauncher::new(Duration::from_millis(2));
    launcher.script("two", Behavior::Hold);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("chain", "/tmp/project", vec![new("one"), cont("two")])
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    launcher.wait_for_launches(2).await;
    assert!(launcher.launches()[1].continued);
    for _ in 0..400 {
        let snapshot = queues.get(&queue.id).await.expect("get");
        if snapshot.commands[1].status == CommandStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let bridge = conductor.bridge();
    assert!(bridge.is_watching("sess-1").await);
    let mut sub = bridge
        .subscribe("sess-1", Some(false))
        .await
        .expect("continued session is watched");
    assert!(launcher.emit(
        "sess-1",
        vec![TranscriptEvent::new(TranscriptEventKind::ToolUse, json!({})).with_id("live")],
    ));

    let delivered = loop {
        let message = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("transcript delivered")
            .expect("subscription open");
        if let BridgeMessage::Transcript(event) = message {
            if event.id.as_deref() == Some("live") {
                break event;
            }
        }
    };
    assert_eq!(delivered.kind, TranscriptEventKind::ToolUse);
    let entry = conductor.tracker().get("sess-1").await.expect("activity entry");
    assert_eq!(entry.status, ActivityStatus::Working);

    assert!(launcher.release("sess-1", 0.10));
    let done = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(done.status, QueueStatus::Completed);
}

#[tokio::test]
async fn continue_commands_resume_the_previous_session() {
    let launcher = FakeLauncher::new(Duration::from_millis(2));
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue(
            "chain",
            "/tmp/project",
            vec![new("one"), cont("two"), new("three"), cont("four")],
        )
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    let done = queues.wait(&queue.id).await.expect("wait");

    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.current_index, 4);
    let record = |session: &str, prompt: &str, continued| LaunchRecord {
        session_id: session.into(),
        prompt: prompt.into(),
        continued,
    };
    assert_eq!(
        launcher.launches(),
        vec![
            record("sess-1", "one", false),
            record("sess-1", "two", true),
            record("sess-2", "three", false),
            record("sess-2", "four", true),
        ]
    );
    assert_eq!(done.commands[1].session_id.as_deref(), Some("sess-1"));
    assert!((done.total_cost_usd - 0.40).abs() < 1e-9);
}

#[tokio::test]
async fn leading_continue_starts_a_new_session() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("fresh", "/tmp/project", vec![cont("first")])
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    queues.wait(&queue.id).await.expect("wait");

    assert!(!launcher.launches()[0].continued);
}

#[tokio::test]
async fn stop_skips_every_pending_command() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("one", Behavior::Hold);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue(
            "stoppable",
            "/tmp/project",
            vec![new("one"), new("two"), new("three"), new("four")],
        )
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    launcher.wait_for_launches(1).await;

    queues.stop(&queue.id).await.expect("stop");
    assert!(matches!(
        queues.pause(&queue.id).await,
        Err(AppError::InvalidTransition { .. })
    ));
    assert!(launcher.release("sess-1", 0.2));
    let done = queues.wait(&queue.id).await.expect("wait");

    assert_eq!(done.status, QueueStatus::Stopped);
    assert_eq!(
        statuses(&done),
        vec![
            CommandStatus::Completed,
            CommandStatus::Skipped,
            CommandStatus::Skipped,
            CommandStatus::Skipped,
        ]
    );
    assert_eq!(launcher.launches().len(), 1);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn pause_takes_effect_after_in_flight_command() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("one", Behavior::Hold);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("pausable", "/tmp/project", vec![new("one"), new("two")])
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    launcher.wait_for_launches(1).await;

    let accepted = queues.pause(&queue.id).await.expect("pause");
    assert_eq!(accepted.status, QueueStatus::Running);
    launcher.release("sess-1", 0.1);

    let paused = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(paused.status, QueueStatus::Paused);
    assert_eq!(paused.current_index, 1);
    assert_eq!(launcher.launches().len(), 1);

    queues.resume(&queue.id).await.expect("resume");
    let done = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(launcher.prompts(), vec!["one", "two"]);
}

#[tokio::test]
async fn resume_withdraws_a_pause_not_yet_applied() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("one", Behavior::Hold);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("flip", "/tmp/project", vec![new("one"), new("two")])
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    launcher.wait_for_launches(1).await;

    queues.pause(&queue.id).await.expect("pause");
    queues.resume(&queue.id).await.expect("resume");
    launcher.release("sess-1", 0.1);

    let done = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(launcher.launches().len(), 2);
}

#[tokio::test]
async fn run_on_a_paused_queue_resumes_it() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("one", Behavior::Hold);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("rerun", "/tmp/project", vec![new("one"), new("two")])
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    launcher.wait_for_launches(1).await;
    queues.pause(&queue.id).await.expect("pause");
    launcher.release("sess-1", 0.1);
    queues.wait(&queue.id).await.expect("paused");

    let resumed = queues.run(&queue.id, KEEP_GOING).await.expect("run again");
    assert_ne!(resumed.status, QueueStatus::Paused);
    let done = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(done.status, QueueStatus::Completed);
}

#[tokio::test]
async fn failure_stops_queue_when_policy_says_so() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("bad", Behavior::Fail);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("strict", "/tmp/project", vec![new("ok"), new("bad"), new("after")])
        .await
        .expect("create");
    queues.run(&queue.id, STRICT).await.expect("run");
    let done = queues.wait(&queue.id).await.expect("wait");

    assert_eq!(done.status, QueueStatus::Failed);
    assert_eq!(
        statuses(&done),
        vec![
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Skipped
        ]
    );
    let failed_cost = done.commands[1].cost_usd.expect("failed command cost");
    assert!((failed_cost - 0.05).abs() < 1e-9);
    assert!(done.commands[1].error.is_some());
    assert_eq!(launcher.prompts(), vec!["ok", "bad"]);
}

#[tokio::test]
async fn failure_is_recorded_and_queue_continues_otherwise() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("bad", Behavior::Fail);
    launcher.script("unlaunchable", Behavior::Reject);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue(
            "lenient",
            "/tmp/project",
            vec![new("bad"), new("unlaunchable"), new("after")],
        )
        .await
        .expect("create");
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    let done = queues.wait(&queue.id).await.expect("wait");

    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(
        statuses(&done),
        vec![
            CommandStatus::Failed,
            CommandStatus::Failed,
            CommandStatus::Completed
        ]
    );
    assert_eq!(launcher.prompts(), vec!["bad", "after"]);
}

#[tokio::test]
async fn pending_commands_can_be_edited_while_running() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    launcher.script("one", Behavior::Hold);
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    let queue = queues
        .create_queue("editable", "/tmp/project", vec![new("one"), new("two"), new("three")])
        .await
        .expect("create");
    let ids: Vec<String> = queue.commands.iter().map(|c| c.id.clone()).collect();
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    launcher.wait_for_launches(1).await;

    let edit = CommandEdit {
        prompt: Some("two-edited".into()),
        ..CommandEdit::default()
    };
    queues
        .update_command(&queue.id, &ids[1], edit.clone())
        .await
        .expect("edit pending");
    let err = queues
        .update_command(&queue.id, &ids[0], edit)
        .await
        .expect_err("running command");
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    queues.remove_command(&queue.id, &ids[2]).await.expect("remove");
    let err = queues
        .remove_command(&queue.id, "no-such-command")
        .await
        .expect_err("unknown command");
    assert!(matches!(err, AppError::NotFound(_)));
    queues.add_command(&queue.id, new("four")).await.expect("add");

    launcher.release("sess-1", 0.1);
    let done = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(launcher.prompts(), vec!["one", "two-edited", "four"]);
}

#[tokio::test]
async fn lifecycle_errors() {
    let launcher = FakeLauncher::new(Duration::from_millis(1));
    let (_dir, conductor) = conductor(&launcher);
    let queues = conductor.queues();

    assert!(matches!(
        queues.run("missing", KEEP_GOING).await,
        Err(AppError::QueueNotFound(_))
    ));
    let err = queues
        .create_queue("bad", "/tmp/project", vec![new("  ")])
        .await
        .expect_err("blank prompt");
    assert!(matches!(err, AppError::Validation(_)));

    let queue = queues
        .create_queue("q", "/tmp/project", vec![new("one")])
        .await
        .expect("create");
    assert!(matches!(
        queues.stop(&queue.id).await,
        Err(AppError::InvalidTransition { .. })
    ));
    queues.run(&queue.id, KEEP_GOING).await.expect("run");
    let done = queues.wait(&queue.id).await.expect("wait");
    assert_eq!(done.status, QueueStatus::Completed);

    assert!(matches!(
        queues.add_command(&queue.id, new("late")).await,
        Err(AppError::InvalidTransition { .. })
    ));
    assert!(matches!(
        queues.run(&queue.id, KEEP_GOING).await,
        Err(AppError::InvalidTransition { .. })
    ));
    conductor.delete_queue(&queue.id).await.expect("delete");
    assert!(queues.list(None).await.is_empty());
}
