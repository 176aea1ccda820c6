//! Server-Sent Events delivery of bridge messages.
//!
//! `GET /sessions/{id}/events` subscribes to the session's bridge feed and
//! streams each message as one SSE event: the frame type as `event:`, the
//! transcript event id (when present) as `id:`, and the JSON payload as
//! `data:`. The stream ends after the `close` event.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{PushFrame, Subscription};
use crate::conductor::Conductor;
use crate::{AppError, Result};

type EventResult = std::result::Result<Event, Infallible>;

/// Query parameters for the events endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Replay earlier events first; the configured default when absent.
    #[serde(default)]
    pub include_existing: Option<bool>,
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

async fn session_events(
    State(conductor): State<Arc<Conductor>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> std::result::Result<Sse<impl Stream<Item = EventResult>>, (StatusCode, String)> {
    let subscription = conductor
        .bridge()
        .subscribe(&session_id, query.include_existing)
        .await
        .map_err(|err| match err {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;
    debug!(session_id, subscription = subscription.id(), "sse subscriber attached");
    Ok(Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default()))
}

/// Convert one push frame into an SSE event.
#[must_use]
pub fn frame_event(frame: &PushFrame) -> Event {
    let event = Event::default()
        .event(frame.event.as_str())
        .data(frame.data.to_string());
    match &frame.id {
        Some(id) => event.id(id.as_str()),
        None => event,
    }
}

/// Frames of `subscription`, ending after the close frame.
pub fn event_stream(
    subscription: Subscription,
) -> impl Stream<Item = EventResult> {
    frame_stream(subscription).map(|frame| Ok(frame_event(&frame)))
}

/// Push frames of `subscription`, ending after the close frame.
pub fn frame_stream(subscription: Subscription) -> impl Stream<Item = PushFrame> {
    stream::unfold(Some(subscription), |state| async move {
        let mut subscription = state?;
        let message = subscription.recv().await?;
        let frame = PushFrame::from_message(subscription.session_id(), &message);
        let next = if frame.is_close() {
            None
        } else {
            Some(subscription)
        };
        Some((frame, next))
    })
}

/// Routes served over HTTP.
pub fn build_router(conductor: Arc<Conductor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/{id}/events", get(session_events))
        .with_state(conductor)
}

/// Serve [`build_router`] on `127.0.0.1:http_port` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Http` if the listener cannot bind or serving fails.
pub async fn serve_http(conductor: Arc<Conductor>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], conductor.config().http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Http(format!("failed to bind {bind}: {err}")))?;

    info!(%bind, "starting HTTP/SSE transport");
    axum::serve(listener, build_router(conductor))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Http(format!("http server error: {err}")))?;

    info!("HTTP/SSE transport shut down");
    Ok(())
}
