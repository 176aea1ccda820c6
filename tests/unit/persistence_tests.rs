//! `SQLite` repositories against an in-memory database.

use std::sync::Arc;

use agent_conductor::models::activity::{ActivityEntry, ActivityFilter, ActivityStatus};
use agent_conductor::models::command_queue::{
    CommandQueue, CommandStatus, QueueCommand, QueueStatus, SessionMode,
};
use agent_conductor::models::session_group::{GroupStatus, SessionGroup, SessionSpec};
use agent_conductor::persistence::activity_repo::ActivityRepo;
use agent_conductor::persistence::db;
use agent_conductor::persistence::group_repo::GroupRepo;
use agent_conductor::persistence::queue_repo::QueueRepo;
use agent_conductor::persistence::schema;
use agent_conductor::AppError;

async fn memory() -> Arc<db::Database> {
    Arc::new(db::connect_memory().await.expect("in-memory db"))
}

fn sample_group() -> SessionGroup {
    let mut group = SessionGroup::new("release", 2).expect("group");
    group.specs = vec![
        SessionSpec::new("build", "/tmp/p", "build it"),
        SessionSpec::new("test", "/tmp/p", "test it").depends_on(["build"]),
    ];
    group
}

fn sample_queue() -> CommandQueue {
    let mut queue = CommandQueue::new("nightly", "/tmp/p").expect("queue");
    queue
        .push_command(QueueCommand::new("first", SessionMode::New))
        .expect("push");
    queue
        .push_command(QueueCommand::new("second", SessionMode::Continue))
        .expect("push");
    queue
}

#[tokio::test]
async fn schema_bootstrap_is_idempotent() {
    let pool = memory().await;
    schema::bootstrap_schema(&pool).await.expect("second bootstrap");
    assert_eq!(
        schema::schema_version(&pool).await.expect("version"),
        schema::SCHEMA_VERSION
    );
}

#[tokio::test]
async fn group_save_and_get_preserve_specs() {
    let repo = GroupRepo::new(memory().await);
    let group = sample_group();
    repo.save(&group).await.expect("save");

    let loaded = repo.get(&group.id).await.expect("get");
    assert_eq!(loaded.name, "release");
    assert_eq!(loaded.max_concurrent, 2);
    assert_eq!(loaded.status, GroupStatus::Pending);
    assert_eq!(loaded.specs, group.specs);
}

#[tokio::test]
async fn group_save_overwrites_existing_row() {
    let repo = GroupRepo::new(memory().await);
    let mut group = sample_group();
    repo.save(&group).await.expect("save");

    group.transition(GroupStatus::Running).expect("run");
    group.total_cost_usd = 1.25;
    repo.save(&group).await.expect("resave");

    let loaded = repo.get(&group.id).await.expect("get");
    assert_eq!(loaded.status, GroupStatus::Running);
    assert!((loaded.total_cost_usd - 1.25).abs() < f64::EPSILON);
    assert_eq!(repo.list(None).await.expect("list").len(), 1);
}

#[tokio::test]
async fn group_list_filters_by_status() {
    let repo = GroupRepo::new(memory().await);
    let pending = sample_group();
    let mut running = sample_group();
    running.transition(GroupStatus::Running).expect("run");
    repo.save(&pending).await.expect("save");
    repo.save(&running).await.expect("save");

    let only_running = repo.list(Some(GroupStatus::Running)).await.expect("list");
    assert_eq!(only_running.len(), 1);
    assert_eq!(only_running[0].id, running.id);
}

#[tokio::test]
async fn missing_group_and_delete() {
    let repo = GroupRepo::new(memory().await);
    assert!(matches!(
        repo.get("nope").await,
        Err(AppError::GroupNotFound(_))
    ));
    let group = sample_group();
    repo.save(&group).await.expect("save");
    assert!(repo.delete(&group.id).await.expect("delete"));
    assert!(!repo.delete(&group.id).await.expect("second delete"));
}

#[tokio::test]
async fn queue_round_trip_keeps_command_order_and_cursor() {
    let repo = QueueRepo::new(memory().await);
    let mut queue = sample_queue();
    queue.transition(QueueStatus::Running).expect("run");
    queue.commands[0].status = CommandStatus::Completed;
    queue.commands[0].session_id = Some("s-1".into());
    queue.current_index = 1;
    repo.save(&queue).await.expect("save");

    let loaded = repo.get(&queue.id).await.expect("get");
    assert_eq!(loaded.status, QueueStatus::Running);
    assert_eq!(loaded.current_index, 1);
    let prompts: Vec<&str> = loaded.commands.iter().map(|c| c.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["first", "second"]);
    assert_eq!(loaded.commands[0].session_id.as_deref(), Some("s-1"));
    assert_eq!(loaded.commands[1].session_mode, SessionMode::Continue);
}

#[tokio::test]
async fn missing_queue_is_queue_not_found() {
    let repo = QueueRepo::new(memory().await);
    assert!(matches!(
        repo.get("nope").await,
        Err(AppError::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn activity_upsert_replaces_by_session() {
    let repo = ActivityRepo::new(memory().await);
    let mut entry = ActivityEntry::new("s-1".into(), "/tmp/a".into(), ActivityStatus::Working);
    repo.upsert(&entry).await.expect("insert");
    entry.status = ActivityStatus::WaitingUserResponse;
    repo.upsert(&entry).await.expect("update");

    let all = repo.list(&ActivityFilter::default()).await.expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, ActivityStatus::WaitingUserResponse);

    assert!(repo.remove("s-1").await.expect("remove"));
    assert!(repo.list(&ActivityFilter::default()).await.expect("list").is_empty());
}

#[tokio::test]
async fn activity_rows_from_other_schema_versions_are_ignored() {
    let pool = memory().await;
    let repo = ActivityRepo::new(Arc::clone(&pool));
    repo.upsert(&ActivityEntry::new(
        "current".into(),
        "/tmp/a".into(),
        ActivityStatus::Idle,
    ))
    .await
    .expect("insert");
    sqlx::query(
        "INSERT INTO activity (session_id, status, project_path, last_updated, schema_version)
         VALUES ('stale', 'idle', '/tmp/a', '2020-01-01T00:00:00Z', 0)",
    )
    .execute(pool.as_ref())
    .await
    .expect("insert stale row");

    let ids: Vec<String> = repo
        .list(&ActivityFilter::default())
        .await
        .expect("list")
        .into_iter()
        .map(|e| e.session_id)
        .collect();
    assert_eq!(ids, vec!["current"]);
}
