use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;

use crate::errors::ApiError;
use crate::handlers::sessions::ActorQuery;
use crate::metrics::SSE_CONNECTIONS_ACTIVE;
use crate::models::SessionOperation;
use crate::services::store::Feed;
use crate::services::AppState;

/// Counts an open stream for as long as it lives.
struct ConnectionGauge;

impl ConnectionGauge {
    fn open() -> Self {
        SSE_CONNECTIONS_ACTIVE.inc();
        Self
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
    }
}

/// Turns a snapshot feed into named SSE events carrying JSON data.
fn snapshot_events<T>(
    feed: Feed<T>,
    event_name: &'static str,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Serialize + Send + 'static,
{
    let gauge = ConnectionGauge::open();
    feed.filter_map(move |snapshot| {
        let _connection = &gauge;
        let event = match Event::default().event(event_name).json_data(&snapshot) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!("Dropping unserializable {} event: {}", event_name, e);
                None
            }
        };
        futures::future::ready(event)
    })
}

/// GET /api/v1/calls/{id}/stream
pub async fn call_stream(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let feed = state.calls.watch(&call_id).await?;
    tracing::info!("Client connected to call stream: call={}", call_id);
    Ok(Sse::new(snapshot_events(feed, "call")).keep_alive(KeepAlive::default()))
}

/// GET /api/v1/tutors/{id}/incoming/stream
pub async fn incoming_stream(
    State(state): State<Arc<AppState>>,
    Path(tutor_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let feed = state.calls.watch_incoming(&tutor_id).await?;
    tracing::info!("Tutor {} listening for incoming calls", tutor_id);
    Ok(Sse::new(snapshot_events(feed, "incoming")).keep_alive(KeepAlive::default()))
}

/// GET /api/v1/sessions/{id}/stream?actor_id=
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .sessions
        .authorize(&session_id, &query.actor_id, SessionOperation::Observe)
        .await?;
    let feed = state
        .store
        .watch_session(&session_id)
        .await?;
    tracing::info!(
        "Client connected to session stream: session={} actor={}",
        session_id,
        query.actor_id
    );
    Ok(Sse::new(snapshot_events(feed, "session")).keep_alive(KeepAlive::default()))
}
