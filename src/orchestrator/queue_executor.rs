//! Sequential command-queue executor.
//!
//! Like the group scheduler, a queue that is not executing is held as a
//! plain value, and `run` hands it to a dedicated task that owns it until the
//! queue reaches a terminal status or the process shuts down.
//! `pause` and `stop` requested while a command is in flight take effect once
//! that command reaches a terminal status.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::budget_guard::SessionReport;
use super::launcher::LaunchRequest;
use super::EngineContext;
use crate::config::QueueConfig;
use crate::models::budget::Usage;
use crate::models::command_queue::{
    CommandEdit, CommandQueue, CommandStatus, QueueCommand, QueueStatus, SessionMode,
};
use crate::{AppError, Result};

const SIGNAL_BUFFER: usize = 32;

/// Per-run execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRunOptions {
    /// Fail the queue on the first failed command instead of moving on.
    pub stop_on_failure: bool,
}

impl Default for QueueRunOptions {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
        }
    }
}

type Reply = oneshot::Sender<Result<CommandQueue>>;

enum QueueSignal {
    Pause(Reply),
    Resume(Reply),
    Stop(Reply),
    AddCommand(QueueCommand, Reply),
    UpdateCommand {
        command_id: String,
        edit: CommandEdit,
        reply: Reply,
    },
    RemoveCommand {
        command_id: String,
        reply: Reply,
    },
}

enum Slot {
    Idle(CommandQueue),
    Active {
        snapshot: watch::Receiver<CommandQueue>,
        signals: mpsc::Sender<QueueSignal>,
    },
}

impl Slot {
    fn current(&self) -> CommandQueue {
        match self {
            Self::Idle(queue) => queue.clone(),
            Self::Active { snapshot, .. } => snapshot.borrow().clone(),
        }
    }
}

/// Owns every command queue and its execution loop.
#[derive(Clone)]
pub struct QueueExecutor {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ctx: EngineContext,
    defaults: QueueConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for QueueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueExecutor")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl QueueExecutor {
    /// Create an executor; loops stop when `cancel` fires.
    #[must_use]
    pub fn new(ctx: EngineContext, defaults: QueueConfig, cancel: CancellationToken) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
            ctx,
            defaults,
            cancel,
        }
    }

    /// Options used when the caller does not supply any.
    #[must_use]
    pub fn default_options(&self) -> QueueRunOptions {
        QueueRunOptions {
            stop_on_failure: self.defaults.stop_on_failure,
        }
    }

    /// Define a queue with an initial command list.
    ///
    /// # Errors
    ///
    /// `AppError::Validation` for a blank name, project path, or prompt.
    pub async fn create_queue(
        &self,
        name: &str,
        project_path: &str,
        commands: Vec<QueueCommand>,
    ) -> Result<CommandQueue> {
        let mut queue = CommandQueue::new(name, project_path)?;
        for command in commands {
            queue.push_command(fresh(command))?;
        }
        info!(queue_id = queue.id, name, commands = queue.commands.len(), "queue created");
        self.slots
            .write()
            .await
            .insert(queue.id.clone(), Slot::Idle(queue.clone()));
        Ok(queue)
    }

    /// Re-register a persisted queue.
    ///
    /// A `running` queue becomes `paused`; its in-flight command returns to
    /// `pending` at the unchanged `current_index`.
    pub async fn restore(&self, mut queue: CommandQueue) {
        if queue.status == QueueStatus::Running {
            queue.status = QueueStatus::Paused;
        }
        for command in &mut queue.commands {
            if command.status == CommandStatus::Running {
                command.status = CommandStatus::Pending;
                command.started_at = None;
            }
        }
        self.slots
            .write()
            .await
            .insert(queue.id.clone(), Slot::Idle(queue));
    }

    /// Append a command.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, `AppError::Validation`, or
    /// `AppError::InvalidTransition` on a terminal queue.
    pub async fn add_command(&self, queue_id: &str, command: QueueCommand) -> Result<CommandQueue> {
        let command = fresh(command);
        if let Some(done) = self
            .mutate_idle(queue_id, |queue| queue.push_command(command.clone()).map(|_| ()))
            .await
        {
            return done;
        }
        self.signal(queue_id, "add command to", |reply| {
            QueueSignal::AddCommand(command, reply)
        })
        .await
    }

    /// Edit a pending command.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, `AppError::NotFound` for an unknown
    /// command, or `AppError::InvalidTransition` once it started.
    pub async fn update_command(
        &self,
        queue_id: &str,
        command_id: &str,
        edit: CommandEdit,
    ) -> Result<CommandQueue> {
        if let Some(done) = self
            .mutate_idle(queue_id, |queue| {
                queue.edit_command(command_id, edit.clone()).map(|_| ())
            })
            .await
        {
            return done;
        }
        let command_id = command_id.to_owned();
        self.signal(queue_id, "update command in", |reply| {
            QueueSignal::UpdateCommand {
                command_id,
                edit,
                reply,
            }
        })
        .await
    }

    /// Remove a pending command.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, `AppError::NotFound` for an unknown
    /// command, or `AppError::InvalidTransition` once it started.
    pub async fn remove_command(&self, queue_id: &str, command_id: &str) -> Result<CommandQueue> {
        if let Some(done) = self
            .mutate_idle(queue_id, |queue| queue.remove_command(command_id).map(|_| ()))
            .await
        {
            return done;
        }
        let command_id = command_id.to_owned();
        self.signal(queue_id, "remove command from", |reply| {
            QueueSignal::RemoveCommand { command_id, reply }
        })
        .await
    }

    /// Start or restart execution from `pending` or `paused`.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, or `AppError::InvalidTransition` from any
    /// other status.
    pub async fn run(&self, queue_id: &str, options: QueueRunOptions) -> Result<CommandQueue> {
        let paused_loop = matches!(
            self.slots.read().await.get(queue_id),
            Some(slot @ Slot::Active { .. }) if slot.current().status == QueueStatus::Paused
        );
        if paused_loop {
            return self.signal(queue_id, "run", QueueSignal::Resume).await;
        }
        self.start_loop(queue_id, options, "run").await
    }

    /// Pause after the in-flight command finishes.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, or `AppError::InvalidTransition` unless the
    /// queue is `running`.
    pub async fn pause(&self, queue_id: &str) -> Result<CommandQueue> {
        self.signal(queue_id, "pause", QueueSignal::Pause).await
    }

    /// Resume at the unchanged `current_index`.
    ///
    /// Resuming a queue whose pause has not yet taken effect cancels the
    /// pause.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, or `AppError::InvalidTransition` unless the
    /// queue is `paused` or has a pending pause.
    pub async fn resume(&self, queue_id: &str) -> Result<CommandQueue> {
        let idle_paused = matches!(
            self.slots.read().await.get(queue_id),
            Some(Slot::Idle(queue)) if queue.status == QueueStatus::Paused
        );
        if idle_paused {
            let options = self.default_options();
            return self.start_loop(queue_id, options, "resume").await;
        }
        self.signal(queue_id, "resume", QueueSignal::Resume).await
    }

    /// Stop the queue: the in-flight command finishes, every remaining
    /// pending command becomes `skipped`, and the queue ends `stopped`.
    ///
    /// Returns as soon as the request is accepted; use [`Self::wait`] for the
    /// final state.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, or `AppError::InvalidTransition` unless the
    /// queue is `running` or `paused`.
    pub async fn stop(&self, queue_id: &str) -> Result<CommandQueue> {
        if let Some(done) = self
            .mutate_idle(queue_id, |queue| {
                if queue.status != QueueStatus::Paused {
                    return Err(AppError::invalid_transition(
                        format!("queue {}", queue.id),
                        queue.status,
                        "stop",
                    ));
                }
                stop_now(queue)
            })
            .await
        {
            return done;
        }
        self.signal(queue_id, "stop", QueueSignal::Stop).await
    }

    /// Remove a queue that is not executing.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound`, or `AppError::InvalidTransition` while the
    /// queue is `running` or `paused`.
    pub async fn delete(&self, queue_id: &str) -> Result<CommandQueue> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get(queue_id)
            .ok_or_else(|| AppError::QueueNotFound(queue_id.to_owned()))?;
        let current = slot.current();
        if matches!(current.status, QueueStatus::Running | QueueStatus::Paused) {
            return Err(AppError::invalid_transition(
                format!("queue {queue_id}"),
                current.status,
                "delete",
            ));
        }
        slots.remove(queue_id);
        info!(queue_id, "queue deleted");
        Ok(current)
    }

    /// Current state of a queue.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound` for unknown ids.
    pub async fn get(&self, queue_id: &str) -> Result<CommandQueue> {
        self.slots
            .read()
            .await
            .get(queue_id)
            .map(Slot::current)
            .ok_or_else(|| AppError::QueueNotFound(queue_id.to_owned()))
    }

    /// Queues, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<QueueStatus>) -> Vec<CommandQueue> {
        let mut queues: Vec<CommandQueue> = self
            .slots
            .read()
            .await
            .values()
            .map(Slot::current)
            .filter(|queue| status.map_or(true, |s| queue.status == s))
            .collect();
        queues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        queues
    }

    /// Receiver that observes every published state of an executing queue.
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound` for unknown ids, or `AppError::Validation`
    /// if the queue has no execution loop.
    pub async fn subscribe(&self, queue_id: &str) -> Result<watch::Receiver<CommandQueue>> {
        match self.slots.read().await.get(queue_id) {
            None => Err(AppError::QueueNotFound(queue_id.to_owned())),
            Some(Slot::Idle(_)) => Err(AppError::Validation(format!(
                "queue {queue_id} is not executing"
            ))),
            Some(Slot::Active { snapshot, .. }) => Ok(snapshot.clone()),
        }
    }

    /// Wait until the queue is terminal or paused.
    ///
    /// Returns immediately for idle queues, and with the last published state
    /// if the loop stops first (shutdown).
    ///
    /// # Errors
    ///
    /// `AppError::QueueNotFound` for unknown ids.
    pub async fn wait(&self, queue_id: &str) -> Result<CommandQueue> {
        let mut rx = match self.subscribe(queue_id).await {
            Ok(rx) => rx,
            Err(AppError::Validation(_)) => return self.get(queue_id).await,
            Err(err) => return Err(err),
        };
        let result = rx
            .wait_for(|queue| queue.status.is_terminal() || queue.status == QueueStatus::Paused)
            .await
            .map(|queue| queue.clone());
        Ok(result.unwrap_or_else(|_| rx.borrow().clone()))
    }

    /// Every queue, for persistence.
    pub async fn snapshots(&self) -> Vec<CommandQueue> {
        self.list(None).await
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "queue loop task failed");
            }
        }
    }

    /// Apply `mutate` to an idle queue in place, all or nothing.
    ///
    /// Returns `None` when the queue has an active loop and the change must
    /// go through it instead.
    async fn mutate_idle<F>(&self, queue_id: &str, mutate: F) -> Option<Result<CommandQueue>>
    where
        F: FnOnce(&mut CommandQueue) -> Result<()>,
    {
        let mut slots = self.slots.write().await;
        match slots.get_mut(queue_id) {
            None => Some(Err(AppError::QueueNotFound(queue_id.to_owned()))),
            Some(Slot::Idle(queue)) => {
                let mut candidate = queue.clone();
                Some(mutate(&mut candidate).map(|()| {
                    *queue = candidate.clone();
                    candidate
                }))
            }
            Some(Slot::Active { .. }) => None,
        }
    }

    async fn start_loop(
        &self,
        queue_id: &str,
        options: QueueRunOptions,
        action: &str,
    ) -> Result<CommandQueue> {
        let mut slots = self.slots.write().await;
        let mut queue = match slots.remove(queue_id) {
            None => return Err(AppError::QueueNotFound(queue_id.to_owned())),
            Some(Slot::Idle(queue))
                if matches!(queue.status, QueueStatus::Pending | QueueStatus::Paused) =>
            {
                queue
            }
            Some(other) => {
                let status = other.current().status;
                slots.insert(queue_id.to_owned(), other);
                return Err(AppError::invalid_transition(
                    format!("queue {queue_id}"),
                    status,
                    action,
                ));
            }
        };

        if let Err(err) = queue.transition(QueueStatus::Running) {
            slots.insert(queue_id.to_owned(), Slot::Idle(queue));
            return Err(err);
        }

        let (publish, snapshot) = watch::channel(queue.clone());
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let driver = QueueDriver {
            queue: queue.clone(),
            options,
            ctx: self.ctx.clone(),
            signals: signals_rx,
            publish,
            in_flight: None,
            pause_requested: false,
            stop_requested: false,
        };
        let span = info_span!("run_queue", queue_id);
        let task = tokio::spawn(driver.run(self.cancel.child_token()).instrument(span));
        self.tasks.lock().await.push(task);

        slots.insert(
            queue_id.to_owned(),
            Slot::Active {
                snapshot,
                signals: signals_tx,
            },
        );
        info!(
            queue_id,
            stop_on_failure = options.stop_on_failure,
            action,
            "queue loop started"
        );
        Ok(queue)
    }

    async fn signal<F>(&self, queue_id: &str, action: &str, make: F) -> Result<CommandQueue>
    where
        F: FnOnce(Reply) -> QueueSignal,
    {
        let (sender, snapshot) = match self.slots.read().await.get(queue_id) {
            None => return Err(AppError::QueueNotFound(queue_id.to_owned())),
            Some(Slot::Idle(queue)) => {
                return Err(AppError::invalid_transition(
                    format!("queue {queue_id}"),
                    queue.status,
                    action,
                ));
            }
            Some(Slot::Active { snapshot, signals }) => (signals.clone(), snapshot.clone()),
        };

        let closed = || {
            AppError::invalid_transition(format!("queue {queue_id}"), snapshot.borrow().status, action)
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(make(tx)).await.is_err() {
            return Err(closed());
        }
        rx.await.map_err(|_| closed())?
    }
}

fn fresh(command: QueueCommand) -> QueueCommand {
    QueueCommand {
        status: CommandStatus::Pending,
        session_id: None,
        cost_usd: None,
        started_at: None,
        completed_at: None,
        error: None,
        ..command
    }
}

fn stop_now(queue: &mut CommandQueue) -> Result<()> {
    queue.transition(QueueStatus::Stopped)?;
    let skipped = queue.skip_pending();
    info!(queue_id = queue.id, skipped, "queue stopped");
    Ok(())
}

// ── Execution loop ───────────────────────────────────────────────────────────

struct QueueDriver {
    queue: CommandQueue,
    options: QueueRunOptions,
    ctx: EngineContext,
    signals: mpsc::Receiver<QueueSignal>,
    publish: watch::Sender<CommandQueue>,
    in_flight: Option<JoinHandle<SessionReport>>,
    pause_requested: bool,
    stop_requested: bool,
}

impl QueueDriver {
    async fn run(mut self, cancel: CancellationToken) {
        info!(
            commands = self.queue.commands.len(),
            current_index = self.queue.current_index,
            "queue run started"
        );

        loop {
            if self.queue.status == QueueStatus::Running && self.in_flight.is_none() {
                self.between_commands().await;
            }
            if self.queue.status.is_terminal() {
                break;
            }
            self.publish.send_replace(self.queue.clone());

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(in_flight = self.in_flight.is_some(), "queue loop cancelled");
                    if let Some(task) = self.in_flight.take() {
                        task.abort();
                    }
                    break;
                }
                Some(signal) = self.signals.recv() => self.handle(signal),
                joined = wait_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.complete(joined).await;
                }
            }
        }

        self.publish.send_replace(self.queue.clone());
    }

    /// Decide what happens while nothing is executing: honour a pending stop
    /// or pause, finish the queue, or start the command at `current_index`.
    async fn between_commands(&mut self) {
        loop {
            if self.stop_requested {
                if let Err(err) = stop_now(&mut self.queue) {
                    error!(%err, "queue could not stop");
                }
                return;
            }
            if self.pause_requested {
                self.pause_requested = false;
                if let Err(err) = self.queue.transition(QueueStatus::Paused) {
                    error!(%err, "queue could not pause");
                }
                info!(current_index = self.queue.current_index, "queue paused");
                return;
            }
            if self.queue.current_index >= self.queue.commands.len() {
                match self.queue.transition(QueueStatus::Completed) {
                    Ok(()) => info!(
                        total_cost_usd = self.queue.total_cost_usd,
                        failed = self.queue.count(CommandStatus::Failed),
                        "queue completed"
                    ),
                    Err(err) => error!(%err, "queue could not complete"),
                }
                return;
            }
            if self.start_current().await {
                return;
            }
            // Launch failed; the failure policy already moved the queue on.
            if self.queue.status != QueueStatus::Running {
                return;
            }
        }
    }

    /// Launch the command at `current_index`; returns whether it is now in
    /// flight.
    async fn start_current(&mut self) -> bool {
        let index = self.queue.current_index;
        let command = &self.queue.commands[index];
        let command_id = command.id.clone();
        let request = LaunchRequest::new(self.queue.project_path.clone(), command.prompt.clone());
        let budget = self.ctx.guard.effective(command.budget);
        let resume = match command.session_mode {
            SessionMode::Continue => self
                .queue
                .continuation_session_id(index)
                .map(str::to_owned),
            SessionMode::New => None,
        };

        let launched = match self.ctx.launch(resume.as_deref(), &request).await {
            Ok(launched) => launched,
            Err(err) => {
                warn!(command_id, %err, "command launch failed");
                self.record_failure(index, err.to_string());
                return false;
            }
        };

        let session_id = launched.session_id.clone();
        let command = &mut self.queue.commands[index];
        command.status = CommandStatus::Running;
        command.session_id = Some(session_id.clone());
        command.started_at = Some(Utc::now());
        self.queue.updated_at = Utc::now();

        let ctx = self.ctx.clone();
        let span = info_span!("supervise", command_id, session_id);
        self.in_flight = Some(tokio::spawn(
            async move {
                AssertUnwindSafe(ctx.guard.supervise(ctx.launcher.as_ref(), launched, budget))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| SessionReport::aborted(&session_id, Usage::default()))
            }
            .instrument(span),
        ));
        info!(
            index,
            command_id,
            continued = resume.is_some(),
            "command started"
        );
        true
    }

    async fn complete(&mut self, joined: std::result::Result<SessionReport, JoinError>) {
        let index = self.queue.current_index;
        let report = match joined {
            Ok(report) => report,
            Err(err) => {
                error!(%err, "supervision task ended abnormally");
                let session_id = self.queue.commands[index].session_id.clone().unwrap_or_default();
                SessionReport::aborted(&session_id, Usage::default())
            }
        };
        self.ctx.release(&report.session_id).await;

        match report.outcome {
            Ok(()) => {
                let command = &mut self.queue.commands[index];
                command.status = CommandStatus::Completed;
                command.cost_usd = Some(report.usage.cost_usd);
                command.completed_at = Some(Utc::now());
                info!(command_id = command.id, cost_usd = report.usage.cost_usd, "command completed");
                self.queue.total_cost_usd += report.usage.cost_usd;
                self.queue.current_index += 1;
                self.queue.updated_at = Utc::now();
            }
            Err(err) => {
                warn!(command_id = self.queue.commands[index].id, %err, "command failed");
                self.queue.commands[index].cost_usd = Some(report.usage.cost_usd);
                self.record_failure(index, err.to_string());
            }
        }
    }

    /// Mark the command at `index` failed, advance, and apply the failure
    /// policy.
    fn record_failure(&mut self, index: usize, cause: String) {
        let command = &mut self.queue.commands[index];
        command.status = CommandStatus::Failed;
        command.error = Some(cause);
        command.completed_at = Some(Utc::now());
        self.queue.current_index = index + 1;
        self.queue.updated_at = Utc::now();

        if self.options.stop_on_failure && !self.stop_requested {
            let skipped = self.queue.skip_pending();
            match self.queue.transition(QueueStatus::Failed) {
                Ok(()) => info!(skipped, "queue failed"),
                Err(err) => error!(%err, "queue could not fail"),
            }
        }
    }

    fn handle(&mut self, signal: QueueSignal) {
        let (result, reply) = match signal {
            QueueSignal::Pause(reply) => (self.request_pause(), reply),
            QueueSignal::Resume(reply) => (self.request_resume(), reply),
            QueueSignal::Stop(reply) => (self.request_stop(), reply),
            QueueSignal::AddCommand(command, reply) => {
                (self.queue.push_command(command).map(|_| ()), reply)
            }
            QueueSignal::UpdateCommand {
                command_id,
                edit,
                reply,
            } => (self.queue.edit_command(&command_id, edit).map(|_| ()), reply),
            QueueSignal::RemoveCommand { command_id, reply } => {
                (self.queue.remove_command(&command_id).map(|_| ()), reply)
            }
        };
        if let Err(err) = &result {
            info!(%err, "queue signal rejected");
        }
        let _ = reply.send(result.map(|()| self.queue.clone()));
    }

    fn rejected(&self, action: &str) -> AppError {
        AppError::invalid_transition(format!("queue {}", self.queue.id), self.queue.status, action)
    }

    fn request_pause(&mut self) -> Result<()> {
        if self.queue.status != QueueStatus::Running || self.stop_requested {
            return Err(self.rejected("pause"));
        }
        if self.in_flight.is_some() {
            self.pause_requested = true;
            info!("pause requested after in-flight command");
        } else {
            self.queue.transition(QueueStatus::Paused)?;
        }
        Ok(())
    }

    fn request_resume(&mut self) -> Result<()> {
        match self.queue.status {
            QueueStatus::Paused => {
                self.queue.transition(QueueStatus::Running)?;
                info!(current_index = self.queue.current_index, "queue resumed");
                Ok(())
            }
            QueueStatus::Running if self.pause_requested => {
                self.pause_requested = false;
                info!("pending pause withdrawn");
                Ok(())
            }
            _ => Err(self.rejected("resume")),
        }
    }

    fn request_stop(&mut self) -> Result<()> {
        match self.queue.status {
            QueueStatus::Paused => stop_now(&mut self.queue),
            QueueStatus::Running => {
                self.stop_requested = true;
                self.pause_requested = false;
                info!(in_flight = self.in_flight.is_some(), "stop requested");
                Ok(())
            }
            _ => Err(self.rejected("stop")),
        }
    }
}

async fn wait_in_flight(
    task: &mut Option<JoinHandle<SessionReport>>,
) -> std::result::Result<SessionReport, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
