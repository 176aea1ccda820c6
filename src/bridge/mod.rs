//! Real-time session observation.
//!
//! Covers transcript polling sources, the activity tracker, the update
//! bridge that fans transcript batches out to subscribers, push framing, and
//! the reconnecting push client.

pub mod framing;
pub mod reconnect;
pub mod source;
pub mod tracker;
pub mod update_bridge;

pub use framing::{BridgeMessage, CloseReason, PushFrame};
pub use tracker::ActivityTracker;
pub use update_bridge::{Subscription, UpdateBridge};
