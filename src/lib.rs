#![forbid(unsafe_code)]

pub mod bridge;
pub mod codec;
pub mod conductor;
pub mod config;
pub mod errors;
pub mod http;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use conductor::Conductor;
pub use errors::{AppError, Result};
