//! Push-client reconnection.
//!
//! A [`PushClient`] keeps a set of session subscriptions alive across
//! transport drops. After a drop it waits an exponentially growing delay,
//! reconnects, and re-subscribes to every session it still follows. Once
//! the attempt budget is spent it settles in
//! [`ConnectionState::Disconnected`] and stops retrying.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framing::{BridgeMessage, CloseReason, PushFrame};
use crate::config::ReconnectConfig;
use crate::{AppError, Result};

// ── Backoff ──────────────────────────────────────────────────────────────────

/// Exponential backoff schedule with an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    /// Build a policy from explicit values.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Build a policy from the `[reconnect]` config section.
    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay before zero-based reconnect `attempt`.
    ///
    /// `base * 2^attempt`, capped at the maximum delay; `None` once the
    /// attempt limit is reached.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }

    /// Configured attempt limit.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

// ── Transport abstraction ────────────────────────────────────────────────────

/// Boxed future returned by connector methods.
pub type ConnectFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Opens push connections to the server.
pub trait PushConnector: Send + Sync {
    /// Establish a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server is unreachable.
    fn connect(&self) -> ConnectFuture<'_, Box<dyn PushConnection>>;
}

/// One live push connection.
pub trait PushConnection: Send {
    /// Follow a session on this connection.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` if the session is not being watched; transport
    /// errors mean the connection is unusable.
    fn subscribe(&mut self, session_id: &str) -> ConnectFuture<'_, ()>;

    /// Stop following a session.
    ///
    /// # Errors
    ///
    /// Transport errors mean the connection is unusable.
    fn unsubscribe(&mut self, session_id: &str) -> ConnectFuture<'_, ()>;

    /// Next pushed frame; `Ok(None)` when the peer closed the connection.
    ///
    /// # Errors
    ///
    /// Transport errors mean the connection is unusable.
    fn next_frame(&mut self) -> ConnectFuture<'_, Option<PushFrame>>;
}

// ── Client state machine ─────────────────────────────────────────────────────

/// Observable client state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Connected with every subscription re-established.
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting {
        /// Attempt about to be made.
        attempt: u32,
        /// Delay before that attempt, in milliseconds.
        delay_ms: u64,
    },
    /// Gave up, was cancelled, or the consumer went away.
    Disconnected,
}

#[derive(Debug)]
enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Cloneable control handle for a running [`PushClient`].
#[derive(Debug, Clone)]
pub struct PushClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl PushClientHandle {
    /// Follow another session; returns `false` if the client has stopped.
    pub fn subscribe(&self, session_id: impl Into<String>) -> bool {
        self.commands
            .send(ClientCommand::Subscribe(session_id.into()))
            .is_ok()
    }

    /// Stop following a session; returns `false` if the client has stopped.
    pub fn unsubscribe(&self, session_id: impl Into<String>) -> bool {
        self.commands
            .send(ClientCommand::Unsubscribe(session_id.into()))
            .is_ok()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

enum Served {
    Dropped,
    Cancelled,
    ConsumerGone,
}

enum Activity {
    Cancelled,
    Command(Option<ClientCommand>),
    Frame(Result<Option<PushFrame>>),
}

/// Reconnecting subscriber over a [`PushConnector`].
pub struct PushClient {
    connector: Box<dyn PushConnector>,
    policy: ReconnectPolicy,
    subscriptions: BTreeSet<String>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    commands_open: bool,
    state: watch::Sender<ConnectionState>,
}

impl PushClient {
    /// Create a client following `sessions` and its control handle.
    #[must_use]
    pub fn new<I, S>(
        connector: Box<dyn PushConnector>,
        policy: ReconnectPolicy,
        sessions: I,
    ) -> (Self, PushClientHandle)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Connecting);
        let client = Self {
            connector,
            policy,
            subscriptions: sessions.into_iter().map(Into::into).collect(),
            commands,
            commands_open: true,
            state,
        };
        let handle = PushClientHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (client, handle)
    }

    /// Sessions currently followed.
    #[must_use]
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    /// Drive the connection until cancelled, the consumer drops `frames`, or
    /// the reconnect budget runs out. Returns the final state.
    pub async fn run(
        mut self,
        frames: mpsc::Sender<PushFrame>,
        cancel: CancellationToken,
    ) -> ConnectionState {
        let mut attempt: u32 = 0;
        loop {
            let connected = tokio::select! {
                () = cancel.cancelled() => return self.finish(),
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(mut conn) => match self.serve(conn.as_mut(), &frames, &cancel, &mut attempt).await {
                    Served::Dropped => info!("push connection dropped"),
                    Served::Cancelled | Served::ConsumerGone => return self.finish(),
                },
                Err(err) => warn!(%err, attempt, "push connection attempt failed"),
            }

            let Some(delay) = self.policy.delay_for(attempt) else {
                warn!(
                    attempts = self.policy.max_attempts(),
                    "reconnect attempts exhausted"
                );
                return self.finish();
            };
            attempt += 1;
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt, delay_ms });
            debug!(attempt, delay_ms, "waiting before reconnect");

            tokio::select! {
                () = cancel.cancelled() => return self.finish(),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(&self) -> ConnectionState {
        self.state.send_replace(ConnectionState::Disconnected);
        ConnectionState::Disconnected
    }

    async fn serve(
        &mut self,
        conn: &mut dyn PushConnection,
        frames: &mpsc::Sender<PushFrame>,
        cancel: &CancellationToken,
        attempt: &mut u32,
    ) -> Served {
        let sessions: Vec<String> = self.subscriptions.iter().cloned().collect();
        for session_id in sessions {
            match self.follow(conn, &session_id, frames).await {
                Ok(true) => {}
                Ok(false) => return Served::ConsumerGone,
                Err(err) => {
                    warn!(%err, session_id, "re-subscribe failed");
                    return Served::Dropped;
                }
            }
        }

        *attempt = 0;
        self.state.send_replace(ConnectionState::Connected);
        info!(sessions = self.subscriptions.len(), "push connection established");

        loop {
            let activity = tokio::select! {
                () = cancel.cancelled() => Activity::Cancelled,
                command = self.commands.recv(), if self.commands_open => Activity::Command(command),
                frame = conn.next_frame() => Activity::Frame(frame),
            };

            match activity {
                Activity::Cancelled => return Served::Cancelled,
                Activity::Command(None) => self.commands_open = false,
                Activity::Command(Some(ClientCommand::Subscribe(session_id))) => {
                    if !self.subscriptions.insert(session_id.clone()) {
                        continue;
                    }
                    match self.follow(conn, &session_id, frames).await {
                        Ok(true) => {}
                        Ok(false) => return Served::ConsumerGone,
                        Err(err) => {
                            warn!(%err, session_id, "subscribe failed");
                            return Served::Dropped;
                        }
                    }
                }
                Activity::Command(Some(ClientCommand::Unsubscribe(session_id))) => {
                    if self.subscriptions.remove(&session_id) {
                        if let Err(err) = conn.unsubscribe(&session_id).await {
                            warn!(%err, session_id, "unsubscribe failed");
                            return Served::Dropped;
                        }
                    }
                }
                Activity::Frame(Ok(Some(frame))) => {
                    if frame.is_close() {
                        self.subscriptions.remove(&frame.session_id);
                    }
                    if frames.send(frame).await.is_err() {
                        return Served::ConsumerGone;
                    }
                }
                Activity::Frame(Ok(None)) => return Served::Dropped,
                Activity::Frame(Err(err)) => {
                    warn!(%err, "push connection read failed");
                    return Served::Dropped;
                }
            }
        }
    }

    /// Subscribe on `conn`. A session that is no longer watched is dropped
    /// from the set and reported to the consumer as closed. Returns
    /// `Ok(false)` when the consumer has gone away.
    async fn follow(
        &mut self,
        conn: &mut dyn PushConnection,
        session_id: &str,
        frames: &mpsc::Sender<PushFrame>,
    ) -> Result<bool> {
        match conn.subscribe(session_id).await {
            Ok(()) => Ok(true),
            Err(AppError::NotFound(_)) => {
                self.subscriptions.remove(session_id);
                let frame = PushFrame::from_message(
                    session_id,
                    &BridgeMessage::Close(CloseReason::Ended),
                );
                Ok(frames.send(frame).await.is_ok())
            }
            Err(err) => Err(err),
        }
    }
}
