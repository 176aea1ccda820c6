//! Domain model module declarations.

pub mod activity;
pub mod budget;
pub mod command_queue;
pub mod session_group;
pub mod transcript;
