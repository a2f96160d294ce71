use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use crate::errors::ApiError;
use crate::extractors::ValidJson;
use crate::models::transport::{RoomKind, RoomTokenRequest};
use crate::models::SessionOperation;
use crate::services::AppState;

/// POST /api/v1/transport/token
///
/// Audio is open to both participants in any phase; the shared editor only
/// while the session is teaching.
pub async fn room_token(
    State(state): State<Arc<AppState>>,
    ValidJson(req): ValidJson<RoomTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = match req.room {
        RoomKind::Audio => SessionOperation::Observe,
        RoomKind::Editor => SessionOperation::Collaborate,
    };
    let (session, _) = state
        .sessions
        .authorize(&req.session_id, &req.participant_identity, operation)
        .await?;
    let room = match req.room {
        RoomKind::Audio => &session.audio_room,
        RoomKind::Editor => &session.editor_room,
    };

    Ok(Json(state.transport.issue(
        room,
        &req.participant_identity,
        &req.participant_name,
    )?))
}
