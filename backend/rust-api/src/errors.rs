use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::{CallStatus, Role, SessionOperation, SessionStatus};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("user {actor_id} is not a party to call {call_id}")]
    NotParticipant { call_id: String, actor_id: String },

    #[error("only the {allowed} may {action} call {call_id}")]
    WrongParty {
        call_id: String,
        action: &'static str,
        allowed: &'static str,
    },

    #[error("call {call_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        call_id: String,
        from: CallStatus,
        to: CallStatus,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("user {actor_id} is not part of session {session_id}")]
    NotParticipant {
        session_id: String,
        actor_id: String,
    },

    #[error("{role:?} cannot {} while the session is {phase:?}", .operation.as_str())]
    Forbidden {
        operation: SessionOperation,
        role: Role,
        phase: SessionStatus,
    },

    #[error("beginner topic not found: {0}")]
    TopicNotFound(String),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("Run your code first before submitting!")]
    RunFirst,

    #[error("no question is loaded")]
    NoActiveQuestion,

    #[error("all {0} attempts used, submit your answer")]
    AttemptsExhausted(u32),

    #[error("the quiz is already finished")]
    Finished,

    #[error("the current round is still being processed")]
    RoundInFlight,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Error)]
pub enum AssessmentError {
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("no problem for topic {topic_id} at level {level}")]
    ProblemNotFound { topic_id: String, level: u8 },

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("level must be between 1 and 5, got {0}")]
    InvalidLevel(u8),

    #[error("attempt {0} is already complete")]
    AlreadyCompleted(String),

    #[error("attempt {0} is still being processed")]
    InFlight(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("model API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Missing credentials are fatal; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::NotConfigured(_))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("room transport is not configured")]
    NotConfigured,

    #[error("failed to sign room token: {0}")]
    Signing(String),
}

/// Error surface of the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Quiz(#[from] QuizError),

    #[error(transparent)]
    Assessment(#[from] AssessmentError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Call(err) => match err {
                CallError::NotFound(_) => StatusCode::NOT_FOUND,
                CallError::NotParticipant { .. } | CallError::WrongParty { .. } => {
                    StatusCode::FORBIDDEN
                }
                CallError::InvalidTransition { .. } => StatusCode::CONFLICT,
                CallError::Session(inner) => session_status(inner),
                CallError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Session(err) => session_status(err),
            ApiError::Quiz(err) => match err {
                QuizError::RunFirst
                | QuizError::NoActiveQuestion
                | QuizError::AttemptsExhausted(_) => StatusCode::UNPROCESSABLE_ENTITY,
                QuizError::Finished | QuizError::RoundInFlight => StatusCode::CONFLICT,
                QuizError::Session(inner) => session_status(inner),
                QuizError::Llm(inner) => llm_status(inner),
            },
            ApiError::Assessment(err) => match err {
                AssessmentError::AttemptNotFound(_)
                | AssessmentError::ProblemNotFound { .. }
                | AssessmentError::TopicNotFound(_) => StatusCode::NOT_FOUND,
                AssessmentError::InvalidLevel(_) => StatusCode::BAD_REQUEST,
                AssessmentError::AlreadyCompleted(_) | AssessmentError::InFlight(_) => {
                    StatusCode::CONFLICT
                }
                AssessmentError::Llm(inner) => llm_status(inner),
                AssessmentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Transport(TransportError::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Transport(TransportError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn session_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotFound(_) | SessionError::TopicNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NotParticipant { .. } | SessionError::Forbidden { .. } => {
            StatusCode::FORBIDDEN
        }
        SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn llm_status(err: &LlmError) -> StatusCode {
    match err {
        LlmError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        // Collaborator failures are shown to the student as a retry hint.
        let message = match status {
            StatusCode::BAD_GATEWAY => {
                "Sorry, I had trouble connecting. Try again in a moment!".to_string()
            }
            _ => self.to_string(),
        };

        (
            status,
            Json(json!({
                "message": message,
                "status": status.as_u16(),
            })),
        )
            .into_response()
    }
}
