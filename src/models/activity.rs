//! Live activity status for tracked sessions.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Latest observed real-time state of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// The engine is producing output or running tools.
    Working,
    /// The engine finished its turn and awaits input.
    WaitingUserResponse,
    /// The session ended or has not produced anything yet.
    Idle,
}

impl ActivityStatus {
    /// Canonical lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::WaitingUserResponse => "waiting_user_response",
            Self::Idle => "idle",
        }
    }

    /// Parse a canonical name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "working" => Ok(Self::Working),
            "waiting_user_response" => Ok(Self::WaitingUserResponse),
            "idle" => Ok(Self::Idle),
            other => Err(AppError::Validation(format!(
                "unknown activity status: {other}"
            ))),
        }
    }
}

impl Display for ActivityStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked session's activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ActivityEntry {
    /// External session id.
    pub session_id: String,
    /// Latest status.
    pub status: ActivityStatus,
    /// Project the session runs in.
    pub project_path: String,
    /// Timestamp of the last observed change.
    pub last_updated: DateTime<Utc>,
}

impl ActivityEntry {
    /// Construct an entry stamped now.
    #[must_use]
    pub fn new(session_id: String, project_path: String, status: ActivityStatus) -> Self {
        Self {
            session_id,
            status,
            project_path,
            last_updated: Utc::now(),
        }
    }
}

/// Filter for activity listings; unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ActivityFilter {
    /// Only entries with this status.
    #[serde(default)]
    pub status: Option<ActivityStatus>,
    /// Only entries for this project.
    #[serde(default)]
    pub project_path: Option<String>,
}

impl ActivityFilter {
    /// Whether `entry` passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &ActivityEntry) -> bool {
        self.status.map_or(true, |s| s == entry.status)
            && self
                .project_path
                .as_deref()
                .map_or(true, |p| p == entry.project_path)
    }
}
