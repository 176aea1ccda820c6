//! Transcript events delivered by a session's polling source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::activity::ActivityStatus;

/// Coarse classification of a transcript entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptEventKind {
    /// Input from the user or controlling application.
    User,
    /// Model output.
    Assistant,
    /// Tool invocation issued by the model.
    ToolUse,
    /// Tool output fed back to the model.
    ToolResult,
    /// Engine bookkeeping.
    System,
    /// End-of-turn summary with usage.
    Result,
    /// Anything the bridge does not classify.
    #[serde(other)]
    Unknown,
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptEvent {
    /// Entry id, when the source provides one.
    #[serde(default)]
    pub id: Option<String>,
    /// Entry classification.
    pub kind: TranscriptEventKind,
    /// Raw entry body.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the entry was written.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    /// Construct an event stamped now.
    #[must_use]
    pub fn new(kind: TranscriptEventKind, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Attach an entry id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Activity status implied by this entry, if any.
    ///
    /// An assistant message that ends its turn, or a turn result, means the
    /// engine waits for input; any other classified entry means it is working.
    #[must_use]
    pub fn implied_status(&self) -> Option<ActivityStatus> {
        match self.kind {
            TranscriptEventKind::Assistant => {
                let stop_reason = self.payload.get("stop_reason").and_then(|v| v.as_str());
                if matches!(stop_reason, Some("end_turn" | "stop_sequence")) {
                    Some(ActivityStatus::WaitingUserResponse)
                } else {
                    Some(ActivityStatus::Working)
                }
            }
            TranscriptEventKind::Result => Some(ActivityStatus::WaitingUserResponse),
            TranscriptEventKind::User
            | TranscriptEventKind::ToolUse
            | TranscriptEventKind::ToolResult
            | TranscriptEventKind::System => Some(ActivityStatus::Working),
            TranscriptEventKind::Unknown => None,
        }
    }
}

/// Events returned by one `receive()` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranscriptBatch {
    /// Events in the order the source observed them.
    pub events: Vec<TranscriptEvent>,
}

impl TranscriptBatch {
    /// Wrap events.
    #[must_use]
    pub fn new(events: Vec<TranscriptEvent>) -> Self {
        Self { events }
    }

    /// Status implied by the last classifiable event.
    #[must_use]
    pub fn implied_status(&self) -> Option<ActivityStatus> {
        self.events.iter().rev().find_map(TranscriptEvent::implied_status)
    }
}
