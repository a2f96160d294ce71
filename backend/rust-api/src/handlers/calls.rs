use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::errors::ApiError;
use crate::extractors::{AppJson, ValidJson};
use crate::models::call::{CallActionRequest, StartCallRequest};
use crate::models::progress::PresenceRequest;
use crate::models::TutorAvailability;
use crate::services::AppState;

/// POST /api/v1/calls
pub async fn start_call(
    State(state): State<Arc<AppState>>,
    ValidJson(req): ValidJson<StartCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        "Student {} calling tutor {} about {}",
        req.student_id,
        req.tutor_id,
        req.topic_id
    );

    let response = state.calls.place_call(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.calls.get(&call_id).await?))
}

pub async fn accept_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    AppJson(req): AppJson<CallActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.calls.accept(&call_id, &req.actor_id).await?))
}

pub async fn decline_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    AppJson(req): AppJson<CallActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.calls.decline(&call_id, &req.actor_id).await?))
}

pub async fn cancel_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    AppJson(req): AppJson<CallActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.calls.cancel(&call_id, &req.actor_id).await?))
}

pub async fn end_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    AppJson(req): AppJson<CallActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.calls.end(&call_id, &req.actor_id).await?))
}

/// GET /api/v1/tutors/{id}/incoming
pub async fn incoming_calls(
    State(state): State<Arc<AppState>>,
    Path(tutor_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.calls.incoming(&tutor_id).await?))
}

/// PUT /api/v1/tutors/{id}/presence
pub async fn set_presence(
    State(state): State<Arc<AppState>>,
    Path(tutor_id): Path<String>,
    AppJson(req): AppJson<PresenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let availability = TutorAvailability {
        display_name: req.display_name.unwrap_or_else(|| tutor_id.clone()),
        uid: tutor_id,
        is_online: req.is_online,
        in_session: req.in_session,
        specialties: req.specialties,
        last_online_at: Utc::now(),
    };
    tracing::debug!(
        "Tutor {} presence: online={} in_session={}",
        availability.uid,
        availability.is_online,
        availability.in_session
    );
    state.store.set_tutor_presence(availability.clone()).await?;
    Ok(Json(availability))
}

/// GET /api/v1/tutors/online
pub async fn online_tutors(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.online_tutors().await?))
}
