use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::errors::ApiError;
use crate::services::AppState;

pub async fn list_topics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_topics().await?))
}

/// GET /api/v1/topics/{id}/levels/{level}/problems
pub async fn level_problems(
    State(state): State<Arc<AppState>>,
    Path((topic_id, level)): Path<(String, u8)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.store.get_problems_for_level(&topic_id, level).await?,
    ))
}

pub async fn beginner_topic(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .get_beginner_topic(&topic_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("beginner topic not found: {}", topic_id)))
}

pub async fn user_progress(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_user_progress(&user_id).await?))
}
