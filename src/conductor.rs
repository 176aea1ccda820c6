//! Process-scoped orchestration service.
//!
//! [`Conductor`] wires the activity tracker, update bridge, group scheduler
//! and queue executor around one injected [`SessionLauncher`], and owns the
//! optional persistence store used to restore state at startup and save it
//! at shutdown.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{ActivityTracker, UpdateBridge};
use crate::config::GlobalConfig;
use crate::models::activity::{ActivityFilter, ActivityStatus};
use crate::models::command_queue::CommandQueue;
use crate::models::session_group::SessionGroup;
use crate::orchestrator::budget_guard::BudgetGuard;
use crate::orchestrator::launcher::SessionLauncher;
use crate::orchestrator::queue_executor::QueueExecutor;
use crate::orchestrator::scheduler::GroupScheduler;
use crate::orchestrator::EngineContext;
use crate::persistence::activity_repo::ActivityRepo;
use crate::persistence::db::Database;
use crate::persistence::group_repo::GroupRepo;
use crate::persistence::queue_repo::QueueRepo;
use crate::Result;

/// What [`Conductor::attach_store`] loaded.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Groups re-registered.
    pub groups: usize,
    /// Queues re-registered.
    pub queues: usize,
    /// Activity entries restored.
    pub activity: usize,
}

#[derive(Clone)]
struct Store {
    groups: GroupRepo,
    queues: QueueRepo,
    activity: ActivityRepo,
}

/// The orchestration engine as a single service object.
pub struct Conductor {
    config: Arc<GlobalConfig>,
    ctx: EngineContext,
    groups: GroupScheduler,
    queues: QueueExecutor,
    store: Option<Store>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Conductor {
    /// Build the engine around `launcher`.
    #[must_use]
    pub fn start(config: GlobalConfig, launcher: Arc<dyn SessionLauncher>) -> Self {
        let cancel = CancellationToken::new();
        let tracker = ActivityTracker::new();
        let bridge = UpdateBridge::new(tracker.clone(), &config.bridge);
        let ctx = EngineContext {
            launcher,
            tracker,
            bridge,
            guard: BudgetGuard::new(config.budget),
        };
        let groups = GroupScheduler::new(
            ctx.clone(),
            config.scheduler.clone(),
            cancel.child_token(),
        );
        let queues = QueueExecutor::new(ctx.clone(), config.queue.clone(), cancel.child_token());

        info!(
            default_max_concurrent = config.scheduler.default_max_concurrent,
            poll_interval_ms = config.bridge.poll_interval_ms,
            "conductor started"
        );
        Self {
            config: Arc::new(config),
            ctx,
            groups,
            queues,
            store: None,
            cancel,
        }
    }

    /// Attach a database and re-register everything persisted in it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if loading fails.
    pub async fn attach_store(&mut self, db: Arc<Database>) -> Result<RestoreSummary> {
        let store = Store {
            groups: GroupRepo::new(Arc::clone(&db)),
            queues: QueueRepo::new(Arc::clone(&db)),
            activity: ActivityRepo::new(db),
        };

        let mut summary = RestoreSummary::default();
        for group in store.groups.list(None).await? {
            self.groups.restore(group).await;
            summary.groups += 1;
        }
        for queue in store.queues.list(None).await? {
            self.queues.restore(queue).await;
            summary.queues += 1;
        }
        for mut entry in store.activity.list(&ActivityFilter::default()).await? {
            // Sessions from a previous process are gone.
            entry.status = ActivityStatus::Idle;
            self.ctx.tracker.restore(entry).await;
            summary.activity += 1;
        }

        info!(
            groups = summary.groups,
            queues = summary.queues,
            activity = summary.activity,
            "persisted state restored"
        );
        self.store = Some(store);
        Ok(summary)
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Session-group scheduler.
    #[must_use]
    pub fn groups(&self) -> &GroupScheduler {
        &self.groups
    }

    /// Command-queue executor.
    #[must_use]
    pub fn queues(&self) -> &QueueExecutor {
        &self.queues
    }

    /// Activity tracker.
    #[must_use]
    pub fn tracker(&self) -> &ActivityTracker {
        &self.ctx.tracker
    }

    /// Update bridge.
    #[must_use]
    pub fn bridge(&self) -> &UpdateBridge {
        &self.ctx.bridge
    }

    /// Token cancelled when the conductor shuts down.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Delete a group from memory and from the store.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or `AppError::Db` if the store delete fails.
    pub async fn delete_group(&self, group_id: &str) -> Result<SessionGroup> {
        let group = self.groups.delete(group_id).await?;
        if let Some(store) = &self.store {
            store.groups.delete(group_id).await?;
        }
        Ok(group)
    }

    /// Delete a queue from memory and from the store.
    ///
    /// # Errors
    ///
    /// Executor errors, or `AppError::Db` if the store delete fails.
    pub async fn delete_queue(&self, queue_id: &str) -> Result<CommandQueue> {
        let queue = self.queues.delete(queue_id).await?;
        if let Some(store) = &self.store {
            store.queues.delete(queue_id).await?;
        }
        Ok(queue)
    }

    /// Write every group, queue and activity entry to the store.
    ///
    /// A no-op without a store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on the first failed write.
    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let groups = self.groups.list(None).await;
        for group in &groups {
            store.groups.save(group).await?;
        }
        let queues = self.queues.snapshots().await;
        for queue in &queues {
            store.queues.save(queue).await?;
        }
        let activity = self.ctx.tracker.list(&ActivityFilter::default()).await;
        for entry in &activity {
            store.activity.upsert(entry).await?;
        }
        info!(
            groups = groups.len(),
            queues = queues.len(),
            activity = activity.len(),
            "state persisted"
        );
        Ok(())
    }

    /// Stop every loop, terminate sessions still active, close the bridge,
    /// and persist the final state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the final save fails.
    pub async fn shutdown(&self) -> Result<()> {
        info!("conductor shutting down");
        self.cancel.cancel();
        self.groups.shutdown().await;
        self.queues.shutdown().await;

        let active = self.ctx.tracker.list(&ActivityFilter::default()).await;
        for entry in active.iter().filter(|e| e.status != ActivityStatus::Idle) {
            if let Err(err) = self.ctx.launcher.terminate(&entry.session_id).await {
                warn!(session_id = entry.session_id, %err, "terminate on shutdown failed");
            }
        }

        self.ctx.bridge.shutdown().await;
        self.persist().await
    }
}
