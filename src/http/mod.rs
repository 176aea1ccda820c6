//! HTTP transport: health probe and per-session SSE push streams.

pub mod sse;

pub use sse::{build_router, serve_http};
