//! Reconnecting push client over a scripted transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_conductor::bridge::reconnect::{
    ConnectFuture, ConnectionState, PushClient, PushConnection, PushConnector, ReconnectPolicy,
};
use agent_conductor::bridge::{BridgeMessage, CloseReason, PushFrame};
use agent_conductor::models::transcript::{TranscriptEvent, TranscriptEventKind};
use agent_conductor::AppError;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What one accepted connection does.
#[derive(Default)]
struct Script {
    frames: VecDeque<PushFrame>,
    /// Keep the connection open once `frames` is drained.
    hang: bool,
    /// Sessions the server reports as not watched.
    missing: Vec<String>,
}

impl Script {
    fn frames(frames: Vec<PushFrame>) -> Self {
        Self {
            frames: frames.into(),
            ..Self::default()
        }
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[derive(Clone, Default)]
struct ScriptedConnector {
    /// `None` entries refuse the connection; an empty queue refuses too.
    scripts: Arc<Mutex<VecDeque<Option<Script>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Option<Script>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

impl PushConnector for ScriptedConnector {
    fn connect(&self) -> ConnectFuture<'_, Box<dyn PushConnection>> {
        let index = self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().expect("scripts").pop_front().flatten();
        let calls = Arc::clone(&self.calls);
        Box::pin(async move {
            match script {
                Some(script) => Ok(Box::new(ScriptedConnection {
                    index,
                    script,
                    calls,
                }) as Box<dyn PushConnection>),
                None => Err(AppError::Ipc("connection refused".into())),
            }
        })
    }
}

struct ScriptedConnection {
    index: usize,
    script: Script,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnection {
    fn record(&self, call: &str, session_id: &str) {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("{}:{call}:{session_id}", self.index));
    }
}

impl PushConnection for ScriptedConnection {
    fn subscribe(&mut self, session_id: &str) -> ConnectFuture<'_, ()> {
        self.record("sub", session_id);
        let missing = self.script.missing.iter().any(|s| s == session_id);
        let session_id = session_id.to_owned();
        Box::pin(async move {
            if missing {
                Err(AppError::NotFound(format!("session {session_id}")))
            } else {
                Ok(())
            }
        })
    }

    fn unsubscribe(&mut self, session_id: &str) -> ConnectFuture<'_, ()> {
        self.record("unsub", session_id);
        Box::pin(async { Ok(()) })
    }

    fn next_frame(&mut self) -> ConnectFuture<'_, Option<PushFrame>> {
        Box::pin(async move {
            match self.script.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None if self.script.hang => std::future::pending().await,
                None => Ok(None),
            }
        })
    }
}

fn transcript(session_id: &str, id: &str) -> PushFrame {
    let event = TranscriptEvent::new(TranscriptEventKind::Assistant, json!({})).with_id(id);
    PushFrame::from_message(session_id, &BridgeMessage::Transcript(event))
}

fn close(session_id: &str) -> PushFrame {
    PushFrame::from_message(session_id, &BridgeMessage::Close(CloseReason::Ended))
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(5), max_attempts)
}

async fn next(rx: &mut mpsc::Receiver<PushFrame>) -> PushFrame {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame in time")
        .expect("client still running")
}

#[tokio::test]
async fn resubscribes_every_session_after_a_drop() {
    let connector = ScriptedConnector::new(vec![
        Some(Script::frames(vec![transcript("s1", "t1")])),
        Some(Script::frames(vec![transcript("s2", "t2"), close("s1")]).hanging()),
    ]);
    let (client, handle) = PushClient::new(Box::new(connector.clone()), fast_policy(3), ["s1", "s2"]);
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(client.run(tx, cancel.clone()));

    assert_eq!(next(&mut rx).await.id.as_deref(), Some("t1"));
    assert_eq!(next(&mut rx).await.id.as_deref(), Some("t2"));
    assert!(next(&mut rx).await.is_close());
    assert_eq!(
        connector.calls(),
        vec!["0:sub:s1", "0:sub:s2", "1:sub:s1", "1:sub:s2"]
    );
    assert_eq!(handle.state(), ConnectionState::Connected);

    cancel.cancel();
    assert_eq!(driver.await.expect("driver"), ConnectionState::Disconnected);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn closed_session_is_not_resubscribed() {
    let connector = ScriptedConnector::new(vec![
        Some(Script::frames(vec![close("s1")])),
        Some(Script::default().hanging()),
    ]);
    let (client, handle) = PushClient::new(Box::new(connector.clone()), fast_policy(3), ["s1", "s2"]);
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(client.run(tx, cancel.clone()));

    assert!(next(&mut rx).await.is_close());
    let mut states = handle.state_changes();
    states
        .wait_for(|state| *state == ConnectionState::Connected && connector.calls().len() == 3)
        .await
        .expect("reconnected");
    assert_eq!(connector.calls(), vec!["0:sub:s1", "0:sub:s2", "1:sub:s2"]);

    cancel.cancel();
    driver.await.expect("driver");
}

#[tokio::test]
async fn unwatched_session_yields_synthetic_close() {
    let connector = ScriptedConnector::new(vec![Some(Script {
        missing: vec!["gone".into()],
        ..Script::default()
    }
    .hanging())]);
    let (client, _handle) = PushClient::new(Box::new(connector.clone()), fast_policy(1), ["gone", "live"]);
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(client.run(tx, cancel.clone()));

    let frame = next(&mut rx).await;
    assert_eq!(frame.session_id, "gone");
    assert!(frame.is_close());
    assert_eq!(frame.data["reason"], "ended");

    cancel.cancel();
    driver.await.expect("driver");
    assert_eq!(connector.calls(), vec!["0:sub:gone", "0:sub:live"]);
}

#[tokio::test]
async fn gives_up_after_attempt_budget() {
    let connector = ScriptedConnector::new(Vec::new());
    let (client, handle) = PushClient::new(Box::new(connector.clone()), fast_policy(3), ["s1"]);
    let (tx, _rx) = mpsc::channel(16);

    let state = tokio::time::timeout(
        Duration::from_secs(2),
        client.run(tx, CancellationToken::new()),
    )
    .await
    .expect("gave up in time");

    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn handle_adds_and_removes_sessions_live() {
    let connector = ScriptedConnector::new(vec![Some(Script::default().hanging())]);
    let (client, handle) = PushClient::new(Box::new(connector.clone()), fast_policy(1), Vec::<String>::new());
    let (tx, _rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(client.run(tx, cancel.clone()));

    let mut states = handle.state_changes();
    states
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .expect("connected");
    assert!(handle.subscribe("s9"));
    assert!(handle.subscribe("s9"));
    assert!(handle.unsubscribe("s9"));
    assert!(handle.unsubscribe("never-followed"));

    for _ in 0..200 {
        if connector.calls().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(connector.calls(), vec!["0:sub:s9", "0:unsub:s9"]);

    cancel.cancel();
    driver.await.expect("driver");
}

#[tokio::test]
async fn dropped_consumer_stops_the_client() {
    let connector = ScriptedConnector::new(vec![Some(
        Script::frames(vec![transcript("s1", "t1")]).hanging(),
    )]);
    let (client, _handle) = PushClient::new(Box::new(connector), fast_policy(3), ["s1"]);
    let (tx, rx) = mpsc::channel(16);
    drop(rx);

    let state = tokio::time::timeout(
        Duration::from_secs(2),
        client.run(tx, CancellationToken::new()),
    )
    .await
    .expect("stopped in time");
    assert_eq!(state, ConnectionState::Disconnected);
}
