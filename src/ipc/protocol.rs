//! Wire types for the local control plane.
//!
//! Every line on the socket is one JSON object. Clients send
//! [`IpcRequest`]s; the server answers each with exactly one
//! [`IpcResponse`], in request order, and interleaves [`PushEnvelope`] lines
//! for subscribed sessions.

use serde::{Deserialize, Serialize};

use crate::bridge::PushFrame;
use crate::models::activity::ActivityStatus;
use crate::models::budget::Budget;
use crate::models::command_queue::{CommandEdit, QueueCommand, QueueStatus, SessionMode};
use crate::models::session_group::{GroupStatus, SessionSpec};
use crate::AppError;

/// A command submitted over IPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Define a session group.
    CreateGroup {
        /// Group name.
        name: String,
        /// Concurrency cap; the configured default when absent.
        #[serde(default)]
        max_concurrent: Option<u32>,
        /// Initial specs.
        #[serde(default)]
        specs: Vec<SessionSpec>,
    },
    /// Add one spec to a group.
    AddSession {
        /// Target group.
        group_id: String,
        /// Spec to add.
        spec: SessionSpec,
    },
    /// Add a dependency edge.
    AddDependency {
        /// Target group.
        group_id: String,
        /// Spec gaining the dependency.
        spec_id: String,
        /// Spec it will wait for.
        depends_on: String,
    },
    /// Start scheduling a group.
    RunGroup {
        /// Target group.
        group_id: String,
        /// Override the configured fail-fast policy.
        #[serde(default)]
        fail_fast: Option<bool>,
    },
    /// Suspend admission.
    PauseGroup {
        /// Target group.
        group_id: String,
    },
    /// Resume admission.
    ResumeGroup {
        /// Target group.
        group_id: String,
    },
    /// Remove a group.
    DeleteGroup {
        /// Target group.
        group_id: String,
    },
    /// Detail of one group.
    #[serde(rename = "group_status")]
    GetGroup {
        /// Target group.
        group_id: String,
    },
    /// All groups, optionally filtered.
    ListGroups {
        /// Only groups with this status.
        #[serde(default)]
        status: Option<GroupStatus>,
    },
    /// Define a command queue.
    CreateQueue {
        /// Queue name.
        name: String,
        /// Project every command runs in.
        project_path: String,
        /// Initial commands.
        #[serde(default)]
        commands: Vec<CommandInput>,
    },
    /// Append a command.
    AddCommand {
        /// Target queue.
        queue_id: String,
        /// Command to append.
        input: CommandInput,
    },
    /// Edit a pending command.
    UpdateCommand {
        /// Target queue.
        queue_id: String,
        /// Command to edit.
        command_id: String,
        /// Field changes.
        edit: CommandEdit,
    },
    /// Remove a pending command.
    RemoveCommand {
        /// Target queue.
        queue_id: String,
        /// Command to remove.
        command_id: String,
    },
    /// Start or restart a queue.
    RunQueue {
        /// Target queue.
        queue_id: String,
        /// Override the configured failure policy.
        #[serde(default)]
        stop_on_failure: Option<bool>,
    },
    /// Pause after the in-flight command.
    PauseQueue {
        /// Target queue.
        queue_id: String,
    },
    /// Resume a paused queue.
    ResumeQueue {
        /// Target queue.
        queue_id: String,
    },
    /// Stop a queue, skipping what remains.
    StopQueue {
        /// Target queue.
        queue_id: String,
    },
    /// Remove a queue.
    DeleteQueue {
        /// Target queue.
        queue_id: String,
    },
    /// Detail of one queue.
    #[serde(rename = "queue_status")]
    GetQueue {
        /// Target queue.
        queue_id: String,
    },
    /// All queues, optionally filtered.
    ListQueues {
        /// Only queues with this status.
        #[serde(default)]
        status: Option<QueueStatus>,
    },
    /// Activity entries, optionally filtered.
    Activity {
        /// Only entries with this status.
        #[serde(default)]
        status: Option<ActivityStatus>,
        /// Only entries for this project.
        #[serde(default)]
        project_path: Option<String>,
    },
    /// Receive pushed frames for a session on this connection.
    Subscribe {
        /// Session to follow.
        session_id: String,
        /// Replay events observed before subscribing.
        #[serde(default)]
        include_existing: Option<bool>,
    },
    /// Stop receiving frames for a session.
    Unsubscribe {
        /// Session to stop following.
        session_id: String,
    },
}

impl IpcRequest {
    /// Command verb, as sent on the wire.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::CreateGroup { .. } => "create_group",
            Self::AddSession { .. } => "add_session",
            Self::AddDependency { .. } => "add_dependency",
            Self::RunGroup { .. } => "run_group",
            Self::PauseGroup { .. } => "pause_group",
            Self::ResumeGroup { .. } => "resume_group",
            Self::DeleteGroup { .. } => "delete_group",
            Self::GetGroup { .. } => "group_status",
            Self::ListGroups { .. } => "list_groups",
            Self::CreateQueue { .. } => "create_queue",
            Self::AddCommand { .. } => "add_command",
            Self::UpdateCommand { .. } => "update_command",
            Self::RemoveCommand { .. } => "remove_command",
            Self::RunQueue { .. } => "run_queue",
            Self::PauseQueue { .. } => "pause_queue",
            Self::ResumeQueue { .. } => "resume_queue",
            Self::StopQueue { .. } => "stop_queue",
            Self::DeleteQueue { .. } => "delete_queue",
            Self::GetQueue { .. } => "queue_status",
            Self::ListQueues { .. } => "list_queues",
            Self::Activity { .. } => "activity",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// A command as submitted by a client; the server assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandInput {
    /// Prompt text.
    pub prompt: String,
    /// `continue` or `new`; defaults to `new`.
    #[serde(default = "default_session_mode")]
    pub session_mode: SessionMode,
    /// Per-command budget.
    #[serde(default)]
    pub budget: Option<Budget>,
}

fn default_session_mode() -> SessionMode {
    SessionMode::New
}

impl CommandInput {
    /// Convert into a pending queue command.
    #[must_use]
    pub fn into_command(self) -> QueueCommand {
        let mut command = QueueCommand::new(self.prompt, self.session_mode);
        command.budget = self.budget;
        command
    }
}

/// Outbound reply to one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error kind tag on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl IpcResponse {
    /// Successful reply carrying `data`.
    #[must_use]
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    /// Failed reply with a free-form message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            kind: None,
        }
    }

    /// Failed reply describing `err`.
    #[must_use]
    pub fn from_error(err: &AppError) -> Self {
        Self {
            kind: Some(err.kind().to_owned()),
            ..Self::error(err.to_string())
        }
    }

    /// Turn the reply back into a result on the client side.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for not-found kinds, otherwise `AppError::Ipc`
    /// carrying the server's message.
    pub fn into_result(self) -> crate::Result<serde_json::Value> {
        if self.ok {
            return Ok(self.data.unwrap_or(serde_json::Value::Null));
        }
        let message = self.error.unwrap_or_else(|| "unknown error".to_owned());
        match self.kind.as_deref() {
            Some("not_found" | "group_not_found" | "queue_not_found") => {
                Err(AppError::NotFound(message))
            }
            _ => Err(AppError::Ipc(message)),
        }
    }
}

/// A pushed frame for a subscribed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEnvelope {
    /// The frame.
    pub push: PushFrame,
}

/// Any line the server may send.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerLine {
    /// Pushed frame.
    Push(PushEnvelope),
    /// Reply to the oldest outstanding request.
    Response(IpcResponse),
}
