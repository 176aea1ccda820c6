use agent_conductor::bridge::ActivityTracker;
use agent_conductor::models::activity::{ActivityEntry, ActivityFilter, ActivityStatus};

#[tokio::test]
async fn begin_registers_working_session() {
    let tracker = ActivityTracker::new();
    let entry = tracker.begin("s-1", "/tmp/a").await;
    assert_eq!(entry.status, ActivityStatus::Working);
    assert_eq!(tracker.get("s-1").await, Some(entry));
}

#[tokio::test]
async fn finish_marks_idle_and_ignores_unknown() {
    let tracker = ActivityTracker::new();
    tracker.begin("s-1", "/tmp/a").await;
    let done = tracker.finish("s-1").await.expect("known session");
    assert_eq!(done.status, ActivityStatus::Idle);
    assert!(tracker.finish("nobody").await.is_none());
}

#[tokio::test]
async fn record_stamps_later_update() {
    let tracker = ActivityTracker::new();
    let first = tracker.begin("s-1", "/tmp/a").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = tracker
        .record("s-1", "/tmp/a", ActivityStatus::WaitingUserResponse)
        .await;
    assert!(second.last_updated >= first.last_updated);
    assert_eq!(second.status, ActivityStatus::WaitingUserResponse);
}

#[tokio::test]
async fn list_filters_and_orders_newest_first() {
    let tracker = ActivityTracker::new();
    tracker.begin("old", "/tmp/a").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    tracker.begin("other", "/tmp/b").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    tracker.begin("new", "/tmp/a").await;

    let all = tracker.list(&ActivityFilter::default()).await;
    let ids: Vec<&str> = all.iter().map(|e| e.session_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "other", "old"]);

    let project_a = tracker
        .list(&ActivityFilter {
            status: None,
            project_path: Some("/tmp/a".into()),
        })
        .await;
    assert_eq!(project_a.len(), 2);
}

#[tokio::test]
async fn restore_inserts_entry_verbatim() {
    let tracker = ActivityTracker::new();
    let entry = ActivityEntry::new("s-9".into(), "/tmp/z".into(), ActivityStatus::Idle);
    tracker.restore(entry.clone()).await;
    assert_eq!(tracker.get("s-9").await, Some(entry));
}
