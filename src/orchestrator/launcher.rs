//! Process-spawning collaborator abstraction.
//!
//! The [`SessionLauncher`] trait decouples the scheduler and queue executor
//! from how an external session is actually executed. Implementations start
//! or continue a session and hand back a [`LaunchedSession`] whose signal
//! channel carries cumulative usage followed by exactly one terminal
//! [`SessionSignal::Exited`].

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::bridge::source::TranscriptSource;
use crate::models::budget::Usage;
use crate::Result;

/// Boxed future returned by launcher methods.
pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What to run and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Project directory the session runs in.
    pub project_path: String,
    /// Prompt handed to the external engine.
    pub prompt: String,
}

impl LaunchRequest {
    /// Construct a request.
    #[must_use]
    pub fn new(project_path: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            prompt: prompt.into(),
        }
    }
}

/// Terminal result reported by the external engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Clean exit with final usage.
    Succeeded {
        /// Final cumulative usage.
        usage: Usage,
    },
    /// Non-zero exit or abnormal termination.
    Failed {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured stderr tail or description.
        stderr: String,
        /// Last usage observed before the failure.
        usage: Usage,
    },
}

/// Signals emitted by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Cumulative usage update.
    Usage(Usage),
    /// Terminal signal; no further signals follow.
    Exited(SessionOutcome),
}

/// Handle for a session that has been started or continued.
pub struct LaunchedSession {
    /// External session identifier.
    pub session_id: String,
    /// Usage and terminal signals, in emission order.
    pub signals: mpsc::Receiver<SessionSignal>,
    /// Transcript polling source, when the launcher exposes one.
    pub transcript: Option<Box<dyn TranscriptSource>>,
}

impl std::fmt::Debug for LaunchedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedSession")
            .field("session_id", &self.session_id)
            .field("transcript", &self.transcript.is_some())
            .finish_non_exhaustive()
    }
}

/// Interface to the external session-execution engine.
pub trait SessionLauncher: Send + Sync {
    /// Start a new session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`](crate::AppError::Process) if the session
    /// cannot be started.
    fn start(&self, request: &LaunchRequest) -> LaunchFuture<'_, LaunchedSession>;

    /// Send a follow-up prompt to an existing session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`](crate::AppError::Process) if the session
    /// cannot be continued.
    fn continue_session(
        &self,
        session_id: &str,
        request: &LaunchRequest,
    ) -> LaunchFuture<'_, LaunchedSession>;

    /// Force a running session to stop.
    ///
    /// Idempotent: terminating an unknown or finished session returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`](crate::AppError::Process) if the
    /// termination signal cannot be delivered.
    fn terminate(&self, session_id: &str) -> LaunchFuture<'_, ()>;
}
