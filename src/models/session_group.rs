//! Session group (dependency DAG) model and lifecycle helpers.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::budget::Budget;
use crate::{AppError, Result};

/// Lifecycle status of a single spec inside a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    /// Waiting on dependencies.
    Pending,
    /// All dependencies completed; waiting for a free slot.
    Ready,
    /// Session started and not yet terminal.
    Running,
    /// Session finished successfully.
    Completed,
    /// Session failed (process error or budget trip).
    Failed,
    /// Never started because an ancestor failed or was skipped.
    Skipped,
}

impl SpecStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Canonical lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl Display for SpecStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Defined but never run.
    Pending,
    /// Scheduling loop admitting sessions.
    Running,
    /// Admission suspended; in-flight sessions continue.
    Paused,
    /// Every spec reached a terminal status.
    Completed,
    /// Fail-fast run observed a failed spec.
    Failed,
}

impl GroupStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Canonical lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a canonical name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::Validation(format!("unknown group status: {other}"))),
        }
    }
}

impl Display for GroupStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a session group graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionSpec {
    /// Caller-chosen identifier, unique within the group.
    pub id: String,
    /// Project directory the session runs in.
    pub project_path: String,
    /// Prompt handed to the external engine.
    pub prompt: String,
    /// Ids of specs that must complete first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Current lifecycle status.
    #[serde(default = "default_spec_status")]
    pub status: SpecStatus,
    /// External session id, assigned once started.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Final (or last reported) cost.
    #[serde(default)]
    pub cost_usd: f64,
    /// Per-spec budget; falls back to the configured default.
    #[serde(default)]
    pub budget: Option<Budget>,
    /// Failure cause, retained for inspection.
    #[serde(default)]
    pub error: Option<String>,
    /// When the session was started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the spec reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_spec_status() -> SpecStatus {
    SpecStatus::Pending
}

impl SessionSpec {
    /// Construct a pending spec with no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, project_path: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_path: project_path.into(),
            prompt: prompt.into(),
            depends_on: BTreeSet::new(),
            status: SpecStatus::Pending,
            session_id: None,
            cost_usd: 0.0,
            budget: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Add dependency ids.
    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Attach a per-spec budget.
    #[must_use]
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Spec with run-time fields cleared, as a caller submits it.
    #[must_use]
    pub fn as_submitted(&self) -> Self {
        Self {
            status: SpecStatus::Pending,
            session_id: None,
            cost_usd: 0.0,
            error: None,
            started_at: None,
            completed_at: None,
            ..self.clone()
        }
    }
}

/// A DAG of session specs scheduled together under a concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionGroup {
    /// Unique record identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Maximum specs in `running` at once; at least 1.
    pub max_concurrent: u32,
    /// Current lifecycle status.
    pub status: GroupStatus,
    /// Specs in insertion order; admission ties break on this order.
    pub specs: Vec<SessionSpec>,
    /// Sum of spec costs recorded so far.
    pub total_cost_usd: f64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SessionGroup {
    /// Construct an empty pending group.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `max_concurrent` is zero or the
    /// name is blank.
    pub fn new(name: impl Into<String>, max_concurrent: u32) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AppError::Validation("group name must not be empty".into()));
        }
        if max_concurrent == 0 {
            return Err(AppError::Validation(
                "max_concurrent must be at least 1".into(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name,
            max_concurrent,
            status: GroupStatus::Pending,
            specs: Vec::new(),
            total_cost_usd: 0.0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Look up a spec by id.
    #[must_use]
    pub fn spec(&self, id: &str) -> Option<&SessionSpec> {
        self.specs.iter().find(|s| s.id == id)
    }

    /// Number of specs currently `running`.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.specs
            .iter()
            .filter(|s| s.status == SpecStatus::Running)
            .count()
    }

    /// Whether every spec is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.specs.iter().all(|s| s.status.is_terminal())
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: GroupStatus) -> bool {
        matches!(
            (self.status, next),
            (GroupStatus::Pending | GroupStatus::Paused, GroupStatus::Running)
                | (
                    GroupStatus::Running,
                    GroupStatus::Paused | GroupStatus::Completed | GroupStatus::Failed
                )
                | (GroupStatus::Paused, GroupStatus::Completed | GroupStatus::Failed)
        )
    }

    /// Apply a transition or reject it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the move is not permitted.
    pub fn transition(&mut self, next: GroupStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::invalid_transition(
                format!("group {}", self.id),
                self.status,
                format!("move to {next}"),
            ));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
