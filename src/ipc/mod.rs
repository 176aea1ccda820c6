//! Local IPC layer for `agent-conductor-ctl` interaction.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands, a matching async client, and
//! the push connector used by reconnecting subscribers.

pub mod client;
pub mod protocol;
pub mod server;
