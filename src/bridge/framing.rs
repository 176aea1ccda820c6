//! Transport-neutral push framing.
//!
//! Every message a subscriber receives is rendered as a [`PushFrame`]: an
//! event name, an optional id, and a JSON body. SSE writes these as
//! `event:`/`id:`/`data:` fields; IPC wraps them in `{"push": ...}` lines.

use serde::{Deserialize, Serialize};

use crate::models::activity::ActivityEntry;
use crate::models::transcript::TranscriptEvent;

/// Why a subscriber stream ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The source reported the end of the transcript.
    Ended,
    /// The poll loop was closed explicitly or the bridge shut down.
    Closed,
}

/// Message delivered to one bridge subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    /// A transcript event, in source order.
    Transcript(TranscriptEvent),
    /// Activity entry after the batch that changed it.
    Activity(ActivityEntry),
    /// Final message; nothing follows.
    Close(CloseReason),
}

/// Event name for transcript frames.
pub const TRANSCRIPT_EVENT: &str = "transcript";
/// Event name for activity frames.
pub const ACTIVITY_EVENT: &str = "activity";
/// Event name for the terminal frame.
pub const CLOSE_EVENT: &str = "close";

/// Wire representation of a [`BridgeMessage`] tagged with its session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PushFrame {
    /// Session the frame belongs to.
    pub session_id: String,
    /// Event name: `transcript`, `activity`, or `close`.
    pub event: String,
    /// Transcript entry id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Frame body.
    pub data: serde_json::Value,
}

impl PushFrame {
    /// Render a bridge message for `session_id`.
    #[must_use]
    pub fn from_message(session_id: &str, message: &BridgeMessage) -> Self {
        let (event, id, data) = match message {
            BridgeMessage::Transcript(event) => (
                TRANSCRIPT_EVENT,
                event.id.clone(),
                serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            ),
            BridgeMessage::Activity(entry) => (
                ACTIVITY_EVENT,
                None,
                serde_json::to_value(entry).unwrap_or(serde_json::Value::Null),
            ),
            BridgeMessage::Close(reason) => (
                CLOSE_EVENT,
                None,
                serde_json::json!({ "reason": reason }),
            ),
        };
        Self {
            session_id: session_id.to_owned(),
            event: event.to_owned(),
            id,
            data,
        }
    }

    /// Whether this is the terminal frame of its session's stream.
    #[must_use]
    pub fn is_close(&self) -> bool {
        self.event == CLOSE_EVENT
    }
}
