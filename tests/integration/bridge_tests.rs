//! Update bridge fan-out over in-process transcript sources.

use std::time::Duration;

use agent_conductor::bridge::source::ChannelSource;
use agent_conductor::bridge::{ActivityTracker, BridgeMessage, CloseReason, Subscription, UpdateBridge};
use agent_conductor::models::activity::ActivityStatus;
use agent_conductor::models::transcript::{TranscriptBatch, TranscriptEvent, TranscriptEventKind};
use agent_conductor::AppError;
use serde_json::json;

use super::test_helpers::test_config;

fn bridge() -> (ActivityTracker, UpdateBridge) {
    let config = test_config("/tmp");
    let tracker = ActivityTracker::new();
    let bridge = UpdateBridge::new(tracker.clone(), &config.bridge);
    (tracker, bridge)
}

fn event(kind: TranscriptEventKind, id: &str) -> TranscriptEvent {
    TranscriptEvent::new(kind, json!({})).with_id(id)
}

fn batch(events: Vec<TranscriptEvent>) -> agent_conductor::Result<TranscriptBatch> {
    Ok(TranscriptBatch::new(events))
}

/// Every message up to and including the close.
async fn drain(sub: &mut Subscription) -> Vec<BridgeMessage> {
    let mut seen = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("subscriber stalled");
        match next {
            Some(message) => {
                let closing = matches!(message, BridgeMessage::Close(_));
                seen.push(message);
                if closing {
                    return seen;
                }
            }
            None => return seen,
        }
    }
}

fn transcript_ids(messages: &[BridgeMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            BridgeMessage::Transcript(event) => event.id.clone(),
            _ => None,
        })
        .collect()
}

fn closes(messages: &[BridgeMessage]) -> Vec<CloseReason> {
    messages
        .iter()
        .filter_map(|m| match m {
            BridgeMessage::Close(reason) => Some(*reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn subscriber_sees_events_in_order_then_one_close() {
    let (tracker, bridge) = bridge();
    let (tx, source) = ChannelSource::new();
    bridge
        .watch("s-1", "/tmp/project", Box::new(source))
        .await
        .expect("watch");
    let mut sub = bridge.subscribe("s-1", Some(false)).await.expect("subscribe");

    tx.send(batch(vec![
        event(TranscriptEventKind::User, "e1"),
        TranscriptEvent::new(TranscriptEventKind::Assistant, json!({ "stop_reason": "end_turn" }))
            .with_id("e2"),
    ]))
    .expect("send");
    drop(tx);

    let messages = drain(&mut sub).await;
    assert_eq!(transcript_ids(&messages), vec!["e1", "e2"]);
    assert_eq!(closes(&messages), vec![CloseReason::Ended]);
    assert!(matches!(messages.last(), Some(BridgeMessage::Close(_))));
    match &messages[2] {
        BridgeMessage::Activity(entry) => {
            assert_eq!(entry.status, ActivityStatus::WaitingUserResponse);
        }
        other => panic!("expected activity after batch, got {other:?}"),
    }
    assert!(sub.recv().await.is_none());

    let entry = tracker.get("s-1").await.expect("tracked");
    assert_eq!(entry.status, ActivityStatus::Idle);
    assert!(!bridge.is_watching("s-1").await);
}

#[tokio::test]
async fn late_subscriber_replays_history_on_request() {
    let (_tracker, bridge) = bridge();
    let (tx, source) = ChannelSource::new();
    bridge
        .watch("s-2", "/tmp/project", Box::new(source))
        .await
        .expect("watch");
    let mut early = bridge.subscribe("s-2", Some(false)).await.expect("subscribe");

    tx.send(batch(vec![event(TranscriptEventKind::User, "h1")]))
        .expect("send");
    let first = tokio::time::timeout(Duration::from_secs(2), early.recv())
        .await
        .expect("first event");
    assert!(matches!(first, Some(BridgeMessage::Transcript(_))));

    let mut replaying = bridge.subscribe("s-2", Some(true)).await.expect("replay");
    let mut live_only = bridge.subscribe("s-2", Some(false)).await.expect("live");
    tx.send(batch(vec![event(TranscriptEventKind::ToolUse, "h2")]))
        .expect("send");
    drop(tx);

    assert_eq!(transcript_ids(&drain(&mut replaying).await), vec!["h1", "h2"]);
    assert_eq!(transcript_ids(&drain(&mut live_only).await), vec!["h2"]);
}

#[tokio::test]
async fn close_is_idempotent_and_notifies_once() {
    let (_tracker, bridge) = bridge();
    let (_tx, source) = ChannelSource::new();
    bridge
        .watch("s-3", "/tmp/project", Box::new(source))
        .await
        .expect("watch");
    let mut a = bridge.subscribe("s-3", None).await.expect("a");
    let mut b = bridge.subscribe("s-3", None).await.expect("b");

    bridge.close("s-3").await;
    bridge.close("s-3").await;
    bridge.close("never-watched").await;

    for sub in [&mut a, &mut b] {
        let messages = drain(sub).await;
        assert_eq!(closes(&messages), vec![CloseReason::Closed]);
        assert!(sub.recv().await.is_none());
    }
    let err = bridge.subscribe("s-3", None).await.expect_err("closed");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn unsubscribed_receiver_gets_nothing_more() {
    let (_tracker, bridge) = bridge();
    let (tx, source) = ChannelSource::new();
    bridge
        .watch("s-4", "/tmp/project", Box::new(source))
        .await
        .expect("watch");
    let mut kept = bridge.subscribe("s-4", None).await.expect("kept");
    let mut dropped = bridge.subscribe("s-4", None).await.expect("dropped");

    assert!(bridge.unsubscribe("s-4", dropped.id()).await);
    assert!(!bridge.unsubscribe("s-4", dropped.id()).await);

    tx.send(batch(vec![event(TranscriptEventKind::User, "u1")]))
        .expect("send");
    drop(tx);

    assert_eq!(transcript_ids(&drain(&mut kept).await), vec!["u1"]);
    assert!(dropped.recv().await.is_none());
}

#[tokio::test]
async fn malformed_units_are_skipped() {
    let (_tracker, bridge) = bridge();
    let (tx, source) = ChannelSource::new();
    bridge
        .watch("s-5", "/tmp/project", Box::new(source))
        .await
        .expect("watch");
    let mut sub = bridge.subscribe("s-5", None).await.expect("subscribe");

    tx.send(Err(AppError::Parse("not json".into()))).expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(batch(vec![event(TranscriptEventKind::User, "ok")]))
        .expect("send");
    drop(tx);

    let messages = drain(&mut sub).await;
    assert_eq!(transcript_ids(&messages), vec!["ok"]);
    assert_eq!(closes(&messages), vec![CloseReason::Ended]);
}

#[tokio::test]
async fn rewatching_a_session_continues_on_the_same_loop() {
    let (tracker, bridge) = bridge();
    let (tx1, first) = ChannelSource::new();
    let (tx2, second) = ChannelSource::new();
    bridge
        .watch("s-6", "/tmp/project", Box::new(first))
        .await
        .expect("watch");
    let mut sub = bridge.subscribe("s-6", Some(true)).await.expect("subscribe");

    tx1.send(batch(vec![event(TranscriptEventKind::Assistant, "r1")]))
        .expect("send");
    bridge
        .watch("s-6", "/tmp/project", Box::new(second))
        .await
        .expect("continued run queued");
    assert_eq!(bridge.watched_sessions().await, vec!["s-6"]);

    drop(tx1);
    tx2.send(batch(vec![event(TranscriptEventKind::Assistant, "r2")]))
        .expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.is_watching("s-6").await, "loop survives the first run's end");
    assert_ne!(
        tracker.get("s-6").await.map(|e| e.status),
        Some(ActivityStatus::Idle)
    );

    drop(tx2);
    let messages = drain(&mut sub).await;
    assert_eq!(transcript_ids(&messages), vec!["r1", "r2"]);
    assert_eq!(closes(&messages), vec![CloseReason::Ended]);
    assert_eq!(
        tracker.get("s-6").await.map(|e| e.status),
        Some(ActivityStatus::Idle)
    );
}

#[tokio::test]
async fn rewatching_after_the_loop_ended_starts_a_fresh_loop() {
    let (_tracker, bridge) = bridge();
    let (tx1, first) = ChannelSource::new();
    bridge
        .watch("s-8", "/tmp/project", Box::new(first))
        .await
        .expect("watch");
    let mut old = bridge.subscribe("s-8", None).await.expect("subscribe");
    drop(tx1);
    assert_eq!(closes(&drain(&mut old).await), vec![CloseReason::Ended]);

    let (tx2, second) = ChannelSource::new();
    bridge
        .watch("s-8", "/tmp/project", Box::new(second))
        .await
        .expect("fresh loop");
    let mut sub = bridge.subscribe("s-8", None).await.expect("subscribe again");
    tx2.send(batch(vec![event(TranscriptEventKind::Assistant, "n1")]))
        .expect("send");
    drop(tx2);
    assert_eq!(transcript_ids(&drain(&mut sub).await), vec!["n1"]);
}

#[tokio::test]
async fn shutdown_closes_loops_and_refuses_more() {
    let (_tracker, bridge) = bridge();
    let (_tx1, first) = ChannelSource::new();
    bridge
        .watch("s-6", "/tmp/project", Box::new(first))
        .await
        .expect("watch");

    let mut sub = bridge.subscribe("s-6", None).await.expect("subscribe");
    bridge.shutdown().await;
    assert_eq!(closes(&drain(&mut sub).await), vec![CloseReason::Closed]);

    let (_tx3, third) = ChannelSource::new();
    let err = bridge
        .watch("s-7", "/tmp/project", Box::new(third))
        .await
        .expect_err("bridge is shut down");
    assert!(matches!(err, AppError::Validation(_)));
}
