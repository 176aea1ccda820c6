//! Command queue model and lifecycle helpers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::budget::Budget;
use crate::{AppError, Result};

/// Whether a command reuses the previous session or starts a fresh one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Continue the most recent session produced by this queue.
    Continue,
    /// Start a new session.
    New,
}

/// Lifecycle status of a queued command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Not yet executed.
    Pending,
    /// Currently executing; always the command at `current_index`.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a failure; `error` holds the cause.
    Failed,
    /// Never executed because the queue stopped or failed first.
    Skipped,
}

impl CommandStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle status of a command queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Defined but never run.
    Pending,
    /// Executing commands.
    Running,
    /// Suspended between commands.
    Paused,
    /// Every command reached a terminal status.
    Completed,
    /// A command failed under the stop-on-failure policy.
    Failed,
    /// Stopped by the caller.
    Stopped,
}

impl QueueStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
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
            Self::Stopped => "stopped",
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
            "stopped" => Ok(Self::Stopped),
            other => Err(AppError::Validation(format!("unknown queue status: {other}"))),
        }
    }
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prompt in a command queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct QueueCommand {
    /// Unique record identifier.
    pub id: String,
    /// Prompt handed to the external engine.
    pub prompt: String,
    /// Continue the prior session or start fresh.
    pub session_mode: SessionMode,
    /// Current lifecycle status.
    pub status: CommandStatus,
    /// Session the command ran in.
    pub session_id: Option<String>,
    /// Cost recorded at completion.
    pub cost_usd: Option<f64>,
    /// Per-command budget; falls back to the configured default.
    #[serde(default)]
    pub budget: Option<Budget>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the command reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure cause, retained for inspection.
    pub error: Option<String>,
}

impl QueueCommand {
    /// Construct a pending command.
    #[must_use]
    pub fn new(prompt: impl Into<String>, session_mode: SessionMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            session_mode,
            status: CommandStatus::Pending,
            session_id: None,
            cost_usd: None,
            budget: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Field changes accepted for a pending command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CommandEdit {
    /// Replacement prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Replacement session mode.
    #[serde(default)]
    pub session_mode: Option<SessionMode>,
    /// Replacement budget.
    #[serde(default)]
    pub budget: Option<Budget>,
}

/// Ordered prompts executed sequentially against one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CommandQueue {
    /// Unique record identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Project directory every command runs in.
    pub project_path: String,
    /// Current lifecycle status.
    pub status: QueueStatus,
    /// Commands in execution order.
    pub commands: Vec<QueueCommand>,
    /// Index of the next command to execute.
    pub current_index: usize,
    /// Running sum of completed command costs.
    pub total_cost_usd: f64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// First transition to `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Transition to a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommandQueue {
    /// Construct an empty pending queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the name or project path is blank.
    pub fn new(name: impl Into<String>, project_path: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let project_path = project_path.into();
        if name.trim().is_empty() {
            return Err(AppError::Validation("queue name must not be empty".into()));
        }
        if project_path.trim().is_empty() {
            return Err(AppError::Validation(
                "queue project_path must not be empty".into(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name,
            project_path,
            status: QueueStatus::Pending,
            commands: Vec::new(),
            current_index: 0,
            total_cost_usd: 0.0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        matches!(
            (self.status, next),
            (QueueStatus::Pending | QueueStatus::Paused, QueueStatus::Running)
                | (
                    QueueStatus::Running,
                    QueueStatus::Paused
                        | QueueStatus::Completed
                        | QueueStatus::Failed
                        | QueueStatus::Stopped
                )
                | (QueueStatus::Paused, QueueStatus::Stopped)
        )
    }

    /// Apply a transition or reject it, stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the move is not permitted.
    pub fn transition(&mut self, next: QueueStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::invalid_transition(
                format!("queue {}", self.id),
                self.status,
                format!("move to {next}"),
            ));
        }
        let now = Utc::now();
        if next == QueueStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Append a pending command; rejected once the queue is terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` on a terminal queue, or
    /// `AppError::Validation` for a blank prompt.
    pub fn push_command(&mut self, command: QueueCommand) -> Result<&QueueCommand> {
        if self.status.is_terminal() {
            return Err(AppError::invalid_transition(
                format!("queue {}", self.id),
                self.status,
                "add command to",
            ));
        }
        if command.prompt.trim().is_empty() {
            return Err(AppError::Validation("command prompt must not be empty".into()));
        }
        if let Some(budget) = &command.budget {
            budget.validate()?;
        }
        self.commands.push(command);
        self.updated_at = Utc::now();
        let last = self.commands.len() - 1;
        Ok(&self.commands[last])
    }

    /// Edit a command that has not started.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids, or
    /// `AppError::InvalidTransition` if the command is no longer pending.
    pub fn edit_command(&mut self, command_id: &str, edit: CommandEdit) -> Result<&QueueCommand> {
        if let Some(prompt) = &edit.prompt {
            if prompt.trim().is_empty() {
                return Err(AppError::Validation("command prompt must not be empty".into()));
            }
        }
        if let Some(budget) = &edit.budget {
            budget.validate()?;
        }
        let index = self.pending_index(command_id, "edit")?;
        let command = &mut self.commands[index];
        if let Some(prompt) = edit.prompt {
            command.prompt = prompt;
        }
        if let Some(mode) = edit.session_mode {
            command.session_mode = mode;
        }
        if edit.budget.is_some() {
            command.budget = edit.budget;
        }
        self.updated_at = Utc::now();
        Ok(&self.commands[index])
    }

    /// Remove a command that has not started.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids, or
    /// `AppError::InvalidTransition` if the command is no longer pending.
    pub fn remove_command(&mut self, command_id: &str) -> Result<QueueCommand> {
        let index = self.pending_index(command_id, "remove")?;
        self.updated_at = Utc::now();
        Ok(self.commands.remove(index))
    }

    /// Session id a `continue` command at `index` should resume.
    ///
    /// This is the most recent session produced by any earlier command.
    #[must_use]
    pub fn continuation_session_id(&self, index: usize) -> Option<&str> {
        self.commands[..index.min(self.commands.len())]
            .iter()
            .rev()
            .find_map(|c| c.session_id.as_deref())
    }

    /// Mark every pending command `skipped`; returns how many changed.
    pub fn skip_pending(&mut self) -> usize {
        let mut skipped = 0;
        for command in &mut self.commands {
            if command.status == CommandStatus::Pending {
                command.status = CommandStatus::Skipped;
                skipped += 1;
            }
        }
        if skipped > 0 {
            self.updated_at = Utc::now();
        }
        skipped
    }

    /// Count commands with the given status.
    #[must_use]
    pub fn count(&self, status: CommandStatus) -> usize {
        self.commands.iter().filter(|c| c.status == status).count()
    }

    fn pending_index(&self, command_id: &str, action: &str) -> Result<usize> {
        let index = self
            .commands
            .iter()
            .position(|c| c.id == command_id)
            .ok_or_else(|| AppError::NotFound(format!("command {command_id}")))?;
        let command = &self.commands[index];
        if command.status != CommandStatus::Pending || index < self.current_index {
            return Err(AppError::invalid_transition(
                format!("command {command_id}"),
                format!("{:?}", command.status).to_lowercase(),
                action,
            ));
        }
        Ok(index)
    }
}
