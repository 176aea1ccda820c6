//! Dependency scheduler for session groups.
//!
//! A group that has never run lives in the scheduler as a plain value. Once
//! `run` is called, a dedicated task takes ownership of the group and becomes
//! its only writer: it admits ready specs up to `max_concurrent`, supervises
//! them, and applies control signals (`pause`, `resume`, `add_session`,
//! `add_dependency`) between events. Callers read the latest state through a
//! `watch` snapshot.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::budget_guard::SessionReport;
use super::graph;
use super::launcher::LaunchRequest;
use super::EngineContext;
use crate::config::SchedulerConfig;
use crate::models::budget::Usage;
use crate::models::session_group::{GroupStatus, SessionGroup, SessionSpec, SpecStatus};
use crate::{AppError, Result};

const SIGNAL_BUFFER: usize = 32;

/// Per-run scheduling options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Fail the whole group as soon as one spec fails.
    pub fail_fast: bool,
}

type Reply = oneshot::Sender<Result<SessionGroup>>;

enum GroupSignal {
    Pause(Reply),
    Resume(Reply),
    AddSession(SessionSpec, Reply),
    AddDependency {
        spec_id: String,
        depends_on: String,
        reply: Reply,
    },
}

enum Slot {
    Idle(SessionGroup),
    Active {
        snapshot: watch::Receiver<SessionGroup>,
        signals: mpsc::Sender<GroupSignal>,
    },
}

impl Slot {
    fn current(&self) -> SessionGroup {
        match self {
            Self::Idle(group) => group.clone(),
            Self::Active { snapshot, .. } => snapshot.borrow().clone(),
        }
    }
}

/// Owns every session group and its scheduling loop.
#[derive(Clone)]
pub struct GroupScheduler {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ctx: EngineContext,
    defaults: SchedulerConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for GroupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupScheduler")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl GroupScheduler {
    /// Create a scheduler; loops stop when `cancel` fires.
    #[must_use]
    pub fn new(ctx: EngineContext, defaults: SchedulerConfig, cancel: CancellationToken) -> Self {
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
    pub fn default_options(&self) -> RunOptions {
        RunOptions {
            fail_fast: self.defaults.fail_fast,
        }
    }

    /// Define a group from a full set of specs.
    ///
    /// # Errors
    ///
    /// `AppError::Validation` for bad fields or unknown references;
    /// `AppError::CircularDependency` if the specs contain a cycle.
    pub async fn create_group(
        &self,
        name: &str,
        max_concurrent: Option<u32>,
        specs: Vec<SessionSpec>,
    ) -> Result<SessionGroup> {
        let mut group = SessionGroup::new(
            name,
            max_concurrent.unwrap_or(self.defaults.default_max_concurrent),
        )?;
        let specs: Vec<SessionSpec> = specs.iter().map(SessionSpec::as_submitted).collect();
        for spec in &specs {
            check_spec_fields(spec)?;
        }
        graph::validate(&specs)?;
        group.specs = specs;

        info!(group_id = group.id, name, specs = group.specs.len(), "group created");
        self.slots
            .write()
            .await
            .insert(group.id.clone(), Slot::Idle(group.clone()));
        Ok(group)
    }

    /// Re-register a persisted group.
    ///
    /// In-flight state from a previous process is normalised: a `running`
    /// group becomes `paused`, and its `running` specs return to `pending`.
    pub async fn restore(&self, mut group: SessionGroup) {
        if group.status == GroupStatus::Running {
            group.status = GroupStatus::Paused;
        }
        for spec in &mut group.specs {
            if matches!(spec.status, SpecStatus::Running | SpecStatus::Ready) {
                spec.status = SpecStatus::Pending;
                spec.session_id = None;
                spec.started_at = None;
            }
        }
        self.slots
            .write()
            .await
            .insert(group.id.clone(), Slot::Idle(group));
    }

    /// Add a spec; the whole graph is re-validated and left unchanged on
    /// failure. Allowed until the group is terminal.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound`, `AppError::Validation`,
    /// `AppError::CircularDependency`, or `AppError::InvalidTransition` on a
    /// terminal group.
    pub async fn add_session(&self, group_id: &str, spec: SessionSpec) -> Result<SessionGroup> {
        let spec = spec.as_submitted();
        {
            let mut slots = self.slots.write().await;
            match slots.get_mut(group_id) {
                None => return Err(AppError::GroupNotFound(group_id.to_owned())),
                Some(Slot::Idle(group)) => {
                    apply_add_session(group, spec)?;
                    return Ok(group.clone());
                }
                Some(Slot::Active { .. }) => {}
            }
        }
        self.signal(group_id, "add session to", |reply| {
            GroupSignal::AddSession(spec, reply)
        })
        .await
    }

    /// Add the edge `spec_id -> depends_on` to a spec that has not started.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound`, `AppError::NotFound` for an unknown spec,
    /// `AppError::Validation` for an unknown dependency,
    /// `AppError::CircularDependency` with the cycle the edge would close, or
    /// `AppError::InvalidTransition` if the spec already started.
    pub async fn add_dependency(
        &self,
        group_id: &str,
        spec_id: &str,
        depends_on: &str,
    ) -> Result<SessionGroup> {
        {
            let mut slots = self.slots.write().await;
            match slots.get_mut(group_id) {
                None => return Err(AppError::GroupNotFound(group_id.to_owned())),
                Some(Slot::Idle(group)) => {
                    apply_add_dependency(group, spec_id, depends_on)?;
                    return Ok(group.clone());
                }
                Some(Slot::Active { .. }) => {}
            }
        }
        let (spec_id, depends_on) = (spec_id.to_owned(), depends_on.to_owned());
        self.signal(group_id, "add dependency to", |reply| {
            GroupSignal::AddDependency {
                spec_id,
                depends_on,
                reply,
            }
        })
        .await
    }

    /// Start scheduling a `pending` group.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound`, or `AppError::InvalidTransition` unless the
    /// group is `pending`.
    pub async fn run(&self, group_id: &str, options: RunOptions) -> Result<SessionGroup> {
        self.start_loop(group_id, options, GroupStatus::Pending, "run")
            .await
    }

    /// Suspend admission; in-flight sessions keep running.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound`, or `AppError::InvalidTransition` unless the
    /// group is `running`.
    pub async fn pause(&self, group_id: &str) -> Result<SessionGroup> {
        self.signal(group_id, "pause", GroupSignal::Pause).await
    }

    /// Resume admission from the current statuses.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound`, or `AppError::InvalidTransition` unless the
    /// group is `paused`.
    pub async fn resume(&self, group_id: &str) -> Result<SessionGroup> {
        let idle_paused = matches!(
            self.slots.read().await.get(group_id),
            Some(Slot::Idle(group)) if group.status == GroupStatus::Paused
        );
        if idle_paused {
            let options = self.default_options();
            return self
                .start_loop(group_id, options, GroupStatus::Paused, "resume")
                .await;
        }
        self.signal(group_id, "resume", GroupSignal::Resume).await
    }

    /// Remove a group that is not in flight.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound`, or `AppError::InvalidTransition` while the
    /// group is `running` or `paused`.
    pub async fn delete(&self, group_id: &str) -> Result<SessionGroup> {
        let mut slots = self.slots.write().await;
        let current = slots
            .get(group_id)
            .ok_or_else(|| AppError::GroupNotFound(group_id.to_owned()))?
            .current();
        if matches!(current.status, GroupStatus::Running | GroupStatus::Paused) {
            return Err(AppError::invalid_transition(
                format!("group {group_id}"),
                current.status,
                "delete",
            ));
        }
        slots.remove(group_id);
        info!(group_id, "group deleted");
        Ok(current)
    }

    /// Current state of a group.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound` for unknown ids.
    pub async fn get(&self, group_id: &str) -> Result<SessionGroup> {
        self.slots
            .read()
            .await
            .get(group_id)
            .map(Slot::current)
            .ok_or_else(|| AppError::GroupNotFound(group_id.to_owned()))
    }

    /// Groups, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<GroupStatus>) -> Vec<SessionGroup> {
        let mut groups: Vec<SessionGroup> = self
            .slots
            .read()
            .await
            .values()
            .map(Slot::current)
            .filter(|group| status.map_or(true, |s| group.status == s))
            .collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// Receiver that observes every published state of a running group.
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound` for unknown ids, or `AppError::Validation`
    /// if the group has no scheduling loop.
    pub async fn subscribe(&self, group_id: &str) -> Result<watch::Receiver<SessionGroup>> {
        match self.slots.read().await.get(group_id) {
            None => Err(AppError::GroupNotFound(group_id.to_owned())),
            Some(Slot::Idle(_)) => Err(AppError::Validation(format!(
                "group {group_id} has not been run"
            ))),
            Some(Slot::Active { snapshot, .. }) => Ok(snapshot.clone()),
        }
    }

    /// Wait until a running group reaches a terminal status.
    ///
    /// Returns immediately for groups without a loop, and with the last
    /// published state if the loop stops first (shutdown).
    ///
    /// # Errors
    ///
    /// `AppError::GroupNotFound` for unknown ids.
    pub async fn wait(&self, group_id: &str) -> Result<SessionGroup> {
        let mut rx = match self.subscribe(group_id).await {
            Ok(rx) => rx,
            Err(AppError::Validation(_)) => return self.get(group_id).await,
            Err(err) => return Err(err),
        };
        let result = rx
            .wait_for(|group| group.status.is_terminal())
            .await
            .map(|group| group.clone());
        Ok(result.unwrap_or_else(|_| rx.borrow().clone()))
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "group loop task failed");
            }
        }
    }

    async fn start_loop(
        &self,
        group_id: &str,
        options: RunOptions,
        expected: GroupStatus,
        action: &str,
    ) -> Result<SessionGroup> {
        let mut slots = self.slots.write().await;
        let mut group = match slots.remove(group_id) {
            None => return Err(AppError::GroupNotFound(group_id.to_owned())),
            Some(Slot::Idle(group)) if group.status == expected => group,
            Some(other) => {
                let status = other.current().status;
                slots.insert(group_id.to_owned(), other);
                return Err(AppError::invalid_transition(
                    format!("group {group_id}"),
                    status,
                    action,
                ));
            }
        };

        if let Err(err) = group.transition(GroupStatus::Running) {
            slots.insert(group_id.to_owned(), Slot::Idle(group));
            return Err(err);
        }

        let (publish, snapshot) = watch::channel(group.clone());
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let driver = GroupDriver {
            group: group.clone(),
            options,
            ctx: self.ctx.clone(),
            signals: signals_rx,
            publish,
            in_flight: JoinSet::new(),
        };
        let span = info_span!("run_group", group_id);
        let task = tokio::spawn(driver.run(self.cancel.child_token()).instrument(span));
        self.tasks.lock().await.push(task);

        slots.insert(
            group_id.to_owned(),
            Slot::Active {
                snapshot,
                signals: signals_tx,
            },
        );
        info!(group_id, fail_fast = options.fail_fast, action, "group loop started");
        Ok(group)
    }

    async fn signal<F>(&self, group_id: &str, action: &str, make: F) -> Result<SessionGroup>
    where
        F: FnOnce(Reply) -> GroupSignal,
    {
        let (sender, snapshot) = match self.slots.read().await.get(group_id) {
            None => return Err(AppError::GroupNotFound(group_id.to_owned())),
            Some(Slot::Idle(group)) => {
                return Err(AppError::invalid_transition(
                    format!("group {group_id}"),
                    group.status,
                    action,
                ));
            }
            Some(Slot::Active { snapshot, signals }) => (signals.clone(), snapshot.clone()),
        };

        let closed = || {
            AppError::invalid_transition(format!("group {group_id}"), snapshot.borrow().status, action)
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(make(tx)).await.is_err() {
            return Err(closed());
        }
        rx.await.map_err(|_| closed())?
    }
}

// ── Graph mutations ──────────────────────────────────────────────────────────

fn check_spec_fields(spec: &SessionSpec) -> Result<()> {
    if spec.project_path.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "spec {} has an empty project_path",
            spec.id
        )));
    }
    if spec.prompt.trim().is_empty() {
        return Err(AppError::Validation(format!("spec {} has an empty prompt", spec.id)));
    }
    if let Some(budget) = &spec.budget {
        budget.validate()?;
    }
    Ok(())
}

fn reject_if_terminal(group: &SessionGroup, action: &str) -> Result<()> {
    if group.status.is_terminal() {
        return Err(AppError::invalid_transition(
            format!("group {}", group.id),
            group.status,
            action,
        ));
    }
    Ok(())
}

fn apply_add_session(group: &mut SessionGroup, spec: SessionSpec) -> Result<()> {
    reject_if_terminal(group, "add session to")?;
    check_spec_fields(&spec)?;
    let mut candidate = group.specs.clone();
    candidate.push(spec);
    graph::validate(&candidate)?;
    group.specs = candidate;
    group.touch();
    Ok(())
}

fn apply_add_dependency(group: &mut SessionGroup, spec_id: &str, depends_on: &str) -> Result<()> {
    reject_if_terminal(group, "add dependency to")?;
    let spec = group
        .spec(spec_id)
        .ok_or_else(|| AppError::NotFound(format!("spec {spec_id} in group {}", group.id)))?;
    if !matches!(spec.status, SpecStatus::Pending | SpecStatus::Ready) {
        return Err(AppError::invalid_transition(
            format!("spec {spec_id}"),
            spec.status,
            "add dependency to",
        ));
    }
    if spec.depends_on.contains(depends_on) {
        return Ok(());
    }
    if group.spec(depends_on).is_none() {
        return Err(AppError::Validation(format!(
            "spec {spec_id} depends on unknown spec {depends_on}"
        )));
    }
    if let Some(cycle) = graph::cycle_through_edge(&group.specs, spec_id, depends_on) {
        return Err(AppError::CircularDependency { cycle });
    }

    if let Some(spec) = group.specs.iter_mut().find(|s| s.id == spec_id) {
        spec.depends_on.insert(depends_on.to_owned());
    }
    group.touch();
    Ok(())
}

// ── Scheduling loop ──────────────────────────────────────────────────────────

struct GroupDriver {
    group: SessionGroup,
    options: RunOptions,
    ctx: EngineContext,
    signals: mpsc::Receiver<GroupSignal>,
    publish: watch::Sender<SessionGroup>,
    in_flight: JoinSet<(String, SessionReport)>,
}

impl GroupDriver {
    async fn run(mut self, cancel: CancellationToken) {
        info!(
            specs = self.group.specs.len(),
            max_concurrent = self.group.max_concurrent,
            "group run started"
        );

        loop {
            for spec_id in graph::settle(&mut self.group) {
                info!(spec_id, "spec skipped after dependency failure");
            }

            let failed_fast = self.options.fail_fast && self.any_failed();
            if failed_fast {
                self.skip_unstarted();
            } else if self.group.status == GroupStatus::Running && self.admit().await {
                // A launch failure changes readiness; settle again first.
                continue;
            }

            if self.in_flight.is_empty() && self.group.all_terminal() {
                self.finish(failed_fast);
                break;
            }
            self.publish.send_replace(self.group.clone());

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(in_flight = self.in_flight.len(), "group loop cancelled");
                    break;
                }
                Some(signal) = self.signals.recv() => self.handle(signal),
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.complete(joined).await;
                }
            }
        }

        self.publish.send_replace(self.group.clone());
    }

    fn any_failed(&self) -> bool {
        self.group
            .specs
            .iter()
            .any(|spec| spec.status == SpecStatus::Failed)
    }

    fn skip_unstarted(&mut self) {
        let now = Utc::now();
        for spec in &mut self.group.specs {
            if matches!(spec.status, SpecStatus::Pending | SpecStatus::Ready) {
                spec.status = SpecStatus::Skipped;
                spec.error = Some("group failed fast".into());
                spec.completed_at = Some(now);
            }
        }
    }

    fn finish(&mut self, failed_fast: bool) {
        let next = if failed_fast {
            GroupStatus::Failed
        } else {
            GroupStatus::Completed
        };
        match self.group.transition(next) {
            Ok(()) => info!(
                status = %next,
                total_cost_usd = self.group.total_cost_usd,
                "group run finished"
            ),
            Err(err) => error!(%err, "group could not reach a terminal status"),
        }
    }

    /// Start every admissible spec; returns whether any launch failed.
    async fn admit(&mut self) -> bool {
        let mut launch_failed = false;
        for index in graph::admissible(&self.group) {
            let spec = &self.group.specs[index];
            let spec_id = spec.id.clone();
            let request = LaunchRequest::new(spec.project_path.clone(), spec.prompt.clone());
            let budget = self.ctx.guard.effective(spec.budget);

            match self.ctx.launch(None, &request).await {
                Ok(launched) => {
                    let session_id = launched.session_id.clone();
                    let spec = &mut self.group.specs[index];
                    spec.status = SpecStatus::Running;
                    spec.session_id = Some(session_id.clone());
                    spec.started_at = Some(Utc::now());

                    let ctx = self.ctx.clone();
                    let span = info_span!("supervise", spec_id, session_id);
                    self.in_flight.spawn(
                        async move {
                            let report = AssertUnwindSafe(ctx.guard.supervise(
                                ctx.launcher.as_ref(),
                                launched,
                                budget,
                            ))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| SessionReport::aborted(&session_id, Usage::default()));
                            (spec_id, report)
                        }
                        .instrument(span),
                    );
                    info!(spec_id = self.group.specs[index].id, "spec admitted");
                }
                Err(err) => {
                    warn!(spec_id, %err, "session start failed");
                    let spec = &mut self.group.specs[index];
                    spec.status = SpecStatus::Failed;
                    spec.error = Some(err.to_string());
                    spec.completed_at = Some(Utc::now());
                    launch_failed = true;
                }
            }
        }
        self.group.touch();
        launch_failed
    }

    async fn complete(&mut self, joined: std::result::Result<(String, SessionReport), JoinError>) {
        let (spec_id, report) = match joined {
            Ok(done) => done,
            Err(err) => {
                error!(%err, "supervision task ended abnormally");
                return;
            }
        };
        self.ctx.release(&report.session_id).await;

        let Some(spec) = self.group.specs.iter_mut().find(|s| s.id == spec_id) else {
            warn!(spec_id, "completion for unknown spec");
            return;
        };
        spec.cost_usd = report.usage.cost_usd;
        spec.completed_at = Some(Utc::now());
        match report.outcome {
            Ok(()) => {
                spec.status = SpecStatus::Completed;
                info!(spec_id, cost_usd = spec.cost_usd, "spec completed");
            }
            Err(err) => {
                spec.status = SpecStatus::Failed;
                spec.error = Some(err.to_string());
                warn!(spec_id, %err, "spec failed");
            }
        }
        self.group.total_cost_usd += report.usage.cost_usd;
        self.group.touch();
    }

    fn handle(&mut self, signal: GroupSignal) {
        let (result, reply) = match signal {
            GroupSignal::Pause(reply) => (self.transition(GroupStatus::Running, GroupStatus::Paused, "pause"), reply),
            GroupSignal::Resume(reply) => (self.transition(GroupStatus::Paused, GroupStatus::Running, "resume"), reply),
            GroupSignal::AddSession(spec, reply) => (apply_add_session(&mut self.group, spec), reply),
            GroupSignal::AddDependency {
                spec_id,
                depends_on,
                reply,
            } => (
                apply_add_dependency(&mut self.group, &spec_id, &depends_on),
                reply,
            ),
        };
        if let Err(err) = &result {
            info!(%err, "group signal rejected");
        }
        let _ = reply.send(result.map(|()| self.group.clone()));
    }

    fn transition(&mut self, from: GroupStatus, to: GroupStatus, action: &str) -> Result<()> {
        if self.group.status != from {
            return Err(AppError::invalid_transition(
                format!("group {}", self.group.id),
                self.group.status,
                action,
            ));
        }
        self.group.transition(to)?;
        info!(status = %to, "group {action}d");
        Ok(())
    }
}
