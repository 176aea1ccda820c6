//! Budget supervision of a launched session.
//!
//! [`BudgetGuard::supervise`] consumes a session's signal stream, checks every
//! cumulative usage update against the effective budget, and terminates the
//! session the moment a ceiling is crossed.

use tracing::{debug, warn};

use super::launcher::{LaunchedSession, SessionLauncher, SessionOutcome, SessionSignal};
use crate::models::budget::{Budget, Usage};
use crate::{AppError, Result};

/// Result of supervising one session to its end.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Session that ran.
    pub session_id: String,
    /// Last cumulative usage observed, also on failure.
    pub usage: Usage,
    /// `Ok` on success; otherwise the retained failure cause.
    pub outcome: Result<()>,
}

impl SessionReport {
    /// Report for a supervision task that panicked.
    #[must_use]
    pub fn aborted(session_id: &str, usage: Usage) -> Self {
        Self {
            session_id: session_id.to_owned(),
            usage,
            outcome: Err(AppError::Process {
                session_id: Some(session_id.to_owned()),
                exit_code: None,
                stderr: "session supervision aborted".into(),
            }),
        }
    }

    /// Whether the session succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Applies the configured default budget to sessions without their own.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BudgetGuard {
    default_budget: Budget,
}

impl BudgetGuard {
    /// Create a guard with a fallback budget.
    #[must_use]
    pub fn new(default_budget: Budget) -> Self {
        Self { default_budget }
    }

    /// Effective budget: per-item ceilings, filled from the default.
    #[must_use]
    pub fn effective(&self, own: Option<Budget>) -> Budget {
        own.map_or(self.default_budget, |budget| budget.or(self.default_budget))
    }

    /// Drive `session` to its end under `budget`.
    ///
    /// Never returns early without a report: a budget trip terminates the
    /// session through `launcher` and reports `AppError::BudgetExceeded`; a
    /// failed exit reports `AppError::Process`.
    pub async fn supervise(
        &self,
        launcher: &dyn SessionLauncher,
        mut session: LaunchedSession,
        budget: Budget,
    ) -> SessionReport {
        let session_id = session.session_id.clone();
        let mut usage = Usage::default();

        while let Some(signal) = session.signals.recv().await {
            match signal {
                SessionSignal::Usage(update) => {
                    usage = update;
                    if let Err(err) = budget.check(&session_id, &usage) {
                        warn!(session_id, %err, "budget exceeded, terminating session");
                        if let Err(term_err) = launcher.terminate(&session_id).await {
                            warn!(session_id, %term_err, "terminate after budget trip failed");
                        }
                        return SessionReport {
                            session_id,
                            usage,
                            outcome: Err(err),
                        };
                    }
                    debug!(session_id, cost_usd = usage.cost_usd, turns = usage.turns, "usage update");
                }
                SessionSignal::Exited(SessionOutcome::Succeeded { usage: last }) => {
                    let outcome = budget.check(&session_id, &last);
                    return SessionReport {
                        session_id,
                        usage: last,
                        outcome,
                    };
                }
                SessionSignal::Exited(SessionOutcome::Failed {
                    exit_code,
                    stderr,
                    usage: last,
                }) => {
                    return SessionReport {
                        session_id: session_id.clone(),
                        usage: last,
                        outcome: Err(AppError::Process {
                            session_id: Some(session_id),
                            exit_code,
                            stderr,
                        }),
                    };
                }
            }
        }

        SessionReport {
            session_id: session_id.clone(),
            usage,
            outcome: Err(AppError::Process {
                session_id: Some(session_id),
                exit_code: None,
                stderr: "signal stream closed before exit".into(),
            }),
        }
    }
}
