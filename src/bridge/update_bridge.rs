//! Update bridge: one poll loop per watched session, fanned out to many
//! subscribers.
//!
//! Each watched session owns a feed holding the events observed so far and
//! the current subscribers. The poll task is the only writer of a feed; it
//! delivers every batch to every subscriber while holding the feed lock, so a
//! late subscriber's history replay can never interleave with live events.
//! When the loop ends, for any reason, every subscriber receives exactly one
//! [`BridgeMessage::Close`].
//!
//! A continued session is watched again under the same id. Its new source is
//! queued on the running loop, which switches to it once the previous source
//! reports its end marker; subscribers stay attached across the switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::framing::{BridgeMessage, CloseReason};
use super::source::TranscriptSource;
use super::tracker::ActivityTracker;
use crate::config::BridgeConfig;
use crate::models::activity::ActivityStatus;
use crate::models::transcript::{TranscriptBatch, TranscriptEvent};
use crate::{AppError, Result};

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    session_id: String,
    rx: mpsc::UnboundedReceiver<BridgeMessage>,
}

impl Subscription {
    /// Identifier used with [`UpdateBridge::unsubscribe`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session this subscription follows.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next message; `None` after the close message has been consumed or the
    /// subscription was removed.
    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        self.rx.recv().await
    }
}

struct Feed {
    project_path: String,
    history: Vec<TranscriptEvent>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<BridgeMessage>)>,
    closed: bool,
}

type SourceQueue = mpsc::UnboundedReceiver<Box<dyn TranscriptSource>>;

struct Watch {
    feed: Arc<Mutex<Feed>>,
    next_sources: mpsc::UnboundedSender<Box<dyn TranscriptSource>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct BridgeInner {
    watches: Mutex<HashMap<String, Watch>>,
    tracker: ActivityTracker,
    poll_interval: Duration,
    include_existing: bool,
    next_subscription: AtomicU64,
    cancel: CancellationToken,
}

/// Multiplexes transcript polling to any number of subscribers.
#[derive(Clone)]
pub struct UpdateBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for UpdateBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBridge")
            .field("poll_interval", &self.inner.poll_interval)
            .field("include_existing", &self.inner.include_existing)
            .finish_non_exhaustive()
    }
}

impl UpdateBridge {
    /// Create a bridge that refreshes `tracker` on every batch.
    #[must_use]
    pub fn new(tracker: ActivityTracker, settings: &BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                watches: Mutex::new(HashMap::new()),
                tracker,
                poll_interval: settings.poll_interval(),
                include_existing: settings.include_existing,
                next_subscription: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the poll loop for `session_id` and mark the session `working`.
    ///
    /// If the session still has a live loop (its previous run has not drained
    /// yet), `source` is queued on that loop instead and polled after the
    /// current source ends.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the bridge has shut down.
    pub async fn watch(
        &self,
        session_id: &str,
        project_path: &str,
        source: Box<dyn TranscriptSource>,
    ) -> Result<()> {
        let mut watches = self.inner.watches.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(AppError::Validation("update bridge is shut down".into()));
        }
        // Under the watches lock so a draining loop cannot mark it idle after.
        self.inner.tracker.begin(session_id, project_path).await;

        let source = match watches.get(session_id) {
            Some(watch) if !watch.cancel.is_cancelled() => {
                match watch.next_sources.send(source) {
                    Ok(()) => {
                        info!(session_id, "transcript source queued on running poll loop");
                        return Ok(());
                    }
                    Err(mpsc::error::SendError(source)) => source,
                }
            }
            _ => source,
        };

        let feed = Arc::new(Mutex::new(Feed {
            project_path: project_path.to_owned(),
            history: Vec::new(),
            subscribers: Vec::new(),
            closed: false,
        }));
        let (next_sources, queued) = mpsc::unbounded_channel();
        let cancel = self.inner.cancel.child_token();
        let span = info_span!("bridge_poll", session_id);
        let task = tokio::spawn(
            poll_loop(
                Arc::clone(&self.inner),
                session_id.to_owned(),
                Arc::clone(&feed),
                source,
                queued,
                cancel.clone(),
            )
            .instrument(span),
        );
        watches.insert(
            session_id.to_owned(),
            Watch {
                feed,
                next_sources,
                cancel,
                task: Some(task),
            },
        );
        info!(session_id, project_path, "transcript poll loop started");
        Ok(())
    }

    /// Attach a subscriber to a watched session.
    ///
    /// With `include_existing` (or the configured default when `None`), every
    /// event observed so far is delivered first, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no active poll loop.
    pub async fn subscribe(
        &self,
        session_id: &str,
        include_existing: Option<bool>,
    ) -> Result<Subscription> {
        let not_watched =
            || AppError::NotFound(format!("session {session_id} is not being watched"));
        let feed = {
            let watches = self.inner.watches.lock().await;
            watches
                .get(session_id)
                .map(|watch| Arc::clone(&watch.feed))
                .ok_or_else(not_watched)?
        };

        let mut feed = feed.lock().await;
        if feed.closed {
            return Err(not_watched());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if include_existing.unwrap_or(self.inner.include_existing) {
            for event in &feed.history {
                // Receiver is still in scope, so this cannot fail.
                let _ = tx.send(BridgeMessage::Transcript(event.clone()));
            }
        }
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        feed.subscribers.push((id, tx));
        debug!(session_id, subscription = id, "subscriber attached");

        Ok(Subscription {
            id,
            session_id: session_id.to_owned(),
            rx,
        })
    }

    /// Detach a subscriber; returns whether it was attached.
    pub async fn unsubscribe(&self, session_id: &str, subscription_id: u64) -> bool {
        let feed = {
            let watches = self.inner.watches.lock().await;
            watches.get(session_id).map(|watch| Arc::clone(&watch.feed))
        };
        let Some(feed) = feed else {
            return false;
        };
        let mut feed = feed.lock().await;
        let before = feed.subscribers.len();
        feed.subscribers.retain(|(id, _)| *id != subscription_id);
        before != feed.subscribers.len()
    }

    /// Stop a session's poll loop and wait for it to release its source.
    ///
    /// Idempotent: closing an unknown or already-closed session is a no-op.
    pub async fn close(&self, session_id: &str) {
        let task = {
            let mut watches = self.inner.watches.lock().await;
            watches.get_mut(session_id).and_then(|watch| {
                watch.cancel.cancel();
                watch.task.take()
            })
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(session_id, %err, "poll loop task failed");
            }
        }
    }

    /// Whether `session_id` has an active poll loop.
    pub async fn is_watching(&self, session_id: &str) -> bool {
        self.inner.watches.lock().await.contains_key(session_id)
    }

    /// Ids of every watched session, sorted.
    pub async fn watched_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.watches.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every poll loop and refuse new ones.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut watches = self.inner.watches.lock().await;
            watches
                .iter_mut()
                .filter_map(|(id, watch)| watch.task.take().map(|task| (id.clone(), task)))
                .collect()
        };
        for (session_id, task) in tasks {
            if let Err(err) = task.await {
                warn!(session_id, %err, "poll loop task failed during shutdown");
            }
        }
        info!("update bridge shut down");
    }
}

// ── Poll loop ────────────────────────────────────────────────────────────────

async fn poll_loop(
    inner: Arc<BridgeInner>,
    session_id: String,
    feed: Arc<Mutex<Feed>>,
    mut source: Box<dyn TranscriptSource>,
    mut queued: SourceQueue,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => break CloseReason::Closed,
            _ = ticker.tick() => {}
        }

        let received = tokio::select! {
            () = cancel.cancelled() => break CloseReason::Closed,
            received = source.receive() => received,
        };

        match received {
            Ok(Some(batch)) => publish_batch(&inner, &session_id, &feed, batch).await,
            Ok(None) => {
                source.close().await;
                match next_source_or_retire(&inner, &session_id, &feed, &mut queued).await {
                    Some(next) => {
                        debug!(session_id, "switching to continued session's transcript");
                        source = next;
                    }
                    None => break CloseReason::Ended,
                }
            }
            Err(AppError::Parse(msg)) => {
                warn!(session_id, error = %msg, "skipping malformed transcript unit");
            }
            Err(err) => {
                warn!(session_id, %err, "transcript receive failed; retrying next tick");
            }
        }
    };

    source.close().await;

    let notified = {
        let mut feed = feed.lock().await;
        feed.closed = true;
        let subscribers = std::mem::take(&mut feed.subscribers);
        for (_, tx) in &subscribers {
            let _ = tx.send(BridgeMessage::Close(reason));
        }
        subscribers.len()
    };

    if reason == CloseReason::Closed {
        unregister(&inner, &session_id, &feed).await;
    }

    info!(session_id, ?reason, notified, "transcript poll loop finished");
}

/// After an end marker: take a queued source, or mark the session idle and
/// unregister the loop. Both happen under the watches lock, so a concurrent
/// [`UpdateBridge::watch`] either queues onto this loop or starts a new one.
async fn next_source_or_retire(
    inner: &BridgeInner,
    session_id: &str,
    feed: &Arc<Mutex<Feed>>,
    queued: &mut SourceQueue,
) -> Option<Box<dyn TranscriptSource>> {
    let mut watches = inner.watches.lock().await;
    if let Ok(next) = queued.try_recv() {
        return Some(next);
    }
    inner.tracker.finish(session_id).await;
    remove_if_current(&mut watches, session_id, feed);
    None
}

async fn unregister(inner: &BridgeInner, session_id: &str, feed: &Arc<Mutex<Feed>>) {
    let mut watches = inner.watches.lock().await;
    remove_if_current(&mut watches, session_id, feed);
}

/// A replaced loop must not remove its successor's entry.
fn remove_if_current(watches: &mut HashMap<String, Watch>, session_id: &str, feed: &Arc<Mutex<Feed>>) {
    if watches
        .get(session_id)
        .is_some_and(|watch| Arc::ptr_eq(&watch.feed, feed))
    {
        watches.remove(session_id);
    }
}

async fn publish_batch(
    inner: &BridgeInner,
    session_id: &str,
    feed: &Mutex<Feed>,
    batch: TranscriptBatch,
) {
    if batch.events.is_empty() {
        return;
    }

    let project_path = feed.lock().await.project_path.clone();
    let status = match batch.implied_status() {
        Some(status) => status,
        None => inner
            .tracker
            .get(session_id)
            .await
            .map_or(ActivityStatus::Working, |entry| entry.status),
    };
    let entry = inner
        .tracker
        .record(session_id, &project_path, status)
        .await;

    let mut messages: Vec<BridgeMessage> = batch
        .events
        .iter()
        .cloned()
        .map(BridgeMessage::Transcript)
        .collect();
    messages.push(BridgeMessage::Activity(entry));

    let mut feed = feed.lock().await;
    feed.history.extend(batch.events);
    feed.subscribers.retain(|(id, tx)| {
        let delivered = messages.iter().all(|message| tx.send(message.clone()).is_ok());
        if !delivered {
            debug!(session_id, subscription = id, "dropping disconnected subscriber");
        }
        delivered
    });
}
