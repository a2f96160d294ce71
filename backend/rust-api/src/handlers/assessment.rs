use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;

use crate::errors::ApiError;
use crate::extractors::AppJson;
use crate::models::assessment::{AttemptChatRequest, AttemptCodeRequest, StartAttemptRequest};
use crate::services::AppState;

const CHAT_INTERRUPTED: &str = "\n\nSorry, I had trouble connecting. Try again in a moment!";

/// POST /api/v1/levels/{topic}/{level}/attempts
pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Path((topic_id, level)): Path<(String, u8)>,
    AppJson(req): AppJson<StartAttemptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = state
        .assessments
        .start(&topic_id, level, &req.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.assessments.get(&attempt_id).await?))
}

pub async fn run_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<AttemptCodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.assessments.run(&attempt_id, &req.code).await?))
}

pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<AttemptCodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.assessments.submit(&attempt_id, &req.code).await?,
    ))
}

/// POST /api/v1/attempts/{id}/chat, answered as chunked plain text.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<AttemptChatRequest>,
) -> Result<Response, ApiError> {
    let reply = state
        .assessments
        .chat(&attempt_id, &req.message, req.code)
        .await?;

    let body = reply.map(move |chunk| {
        Ok::<_, Infallible>(chunk.unwrap_or_else(|e| {
            tracing::warn!("Tutor reply for attempt {} interrupted: {}", attempt_id, e);
            CHAT_INTERRUPTED.to_string()
        }))
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
