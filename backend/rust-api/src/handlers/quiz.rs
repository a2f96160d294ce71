use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::errors::ApiError;
use crate::extractors::AppJson;
use crate::handlers::sessions::ActorQuery;
use crate::models::quiz::{QuizActionRequest, QuizCodeRequest};
use crate::services::AppState;

/// GET /api/v1/sessions/{id}/quiz?actor_id=
pub async fn quiz_snapshot(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .quizzes
            .snapshot(&session_id, &query.actor_id)
            .await?,
    ))
}

/// POST /api/v1/sessions/{id}/quiz/question
pub async fn load_question(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    AppJson(req): AppJson<QuizActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .quizzes
            .load_question(&session_id, &req.actor_id)
            .await?,
    ))
}

pub async fn run_code(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    AppJson(req): AppJson<QuizCodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .quizzes
            .run(&session_id, &req.actor_id, &req.code)
            .await?,
    ))
}

pub async fn submit_code(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    AppJson(req): AppJson<QuizCodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .quizzes
            .submit(&session_id, &req.actor_id, &req.code)
            .await?,
    ))
}
