use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::errors::ApiError;
use crate::extractors::AppJson;
use crate::models::session::SessionActionRequest;
use crate::models::SessionOperation;
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    pub actor_id: String,
}

/// GET /api/v1/sessions/{id}?actor_id=
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, _) = state
        .sessions
        .authorize(&session_id, &query.actor_id, SessionOperation::Observe)
        .await?;
    Ok(Json(session))
}

/// POST /api/v1/sessions/{id}/start-quiz
pub async fn start_quiz(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    AppJson(req): AppJson<SessionActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Start quiz requested for session {} by {}", session_id, req.actor_id);
    Ok(Json(
        state.sessions.start_quiz(&session_id, &req.actor_id).await?,
    ))
}
