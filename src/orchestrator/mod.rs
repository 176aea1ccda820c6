//! Orchestration engine.
//!
//! Covers dependency-graph validation, the session-group scheduler, the
//! command-queue executor, budget supervision, and the process launcher
//! that runs sessions as host CLI child processes.

pub mod budget_guard;
pub mod graph;
pub mod launcher;
pub mod queue_executor;
pub mod scheduler;
pub mod spawner;

use std::sync::Arc;

use tracing::warn;

use crate::bridge::{ActivityTracker, UpdateBridge};
use budget_guard::BudgetGuard;
use crate::Result;
use launcher::{LaunchRequest, LaunchedSession, SessionLauncher};

/// Collaborators shared by every group and queue loop.
#[derive(Clone)]
pub struct EngineContext {
    /// Starts, continues, and terminates sessions.
    pub launcher: Arc<dyn SessionLauncher>,
    /// Live activity per session.
    pub tracker: ActivityTracker,
    /// Transcript fan-out.
    pub bridge: UpdateBridge,
    /// Budget supervision with the configured default budget.
    pub guard: BudgetGuard,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Start a session, or continue `resume` when given, and register it for
    /// observation.
    ///
    /// The session's transcript source gets a bridge poll loop (or is handed
    /// to the loop still draining the session's previous run) and its
    /// activity entry becomes `working`.
    ///
    /// # Errors
    ///
    /// Returns the launcher's error, or the bridge's when the transcript
    /// cannot be watched; in the latter case the session is terminated first.
    pub async fn launch(
        &self,
        resume: Option<&str>,
        request: &LaunchRequest,
    ) -> Result<LaunchedSession> {
        let mut launched = match resume {
            Some(session_id) => self.launcher.continue_session(session_id, request).await?,
            None => self.launcher.start(request).await?,
        };

        let Some(source) = launched.transcript.take() else {
            self.tracker
                .begin(&launched.session_id, &request.project_path)
                .await;
            return Ok(launched);
        };
        if let Err(err) = self
            .bridge
            .watch(&launched.session_id, &request.project_path, source)
            .await
        {
            warn!(session_id = launched.session_id, %err, "transcript not watched, terminating session");
            if let Err(term_err) = self.launcher.terminate(&launched.session_id).await {
                warn!(session_id = launched.session_id, %term_err, "terminate failed");
            }
            return Err(err);
        }
        Ok(launched)
    }

    /// Mark a session idle once it reached a terminal state.
    pub async fn release(&self, session_id: &str) {
        self.tracker.finish(session_id).await;
    }
}
