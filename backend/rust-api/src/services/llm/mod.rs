use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use crate::errors::LlmError;
use crate::models::assessment::{AssessmentContext, ChatContext};
use crate::models::quiz::{EvaluationReply, EvaluationRequest, GeneratedQuestion, QuestionRequest};

pub mod gemini;
pub mod json;
pub mod prompts;

pub use gemini::GeminiTutor;

/// Text chunks as the model produces them.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

/// Language-model collaborator. Structured calls return validated replies;
/// a reply that never parses surfaces as `LlmError::Malformed`.
#[async_trait]
pub trait TutorLlm: Send + Sync {
    async fn generate_question(
        &self,
        request: &QuestionRequest,
    ) -> Result<GeneratedQuestion, LlmError>;

    async fn evaluate_submission(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationReply, LlmError>;

    /// Free text ending in a fenced JSON verdict.
    async fn assess_level_submission(
        &self,
        context: &AssessmentContext,
    ) -> Result<TextStream, LlmError>;

    async fn chat_reply(&self, context: &ChatContext) -> Result<TextStream, LlmError>;
}

pub async fn collect_text(mut stream: TextStream) -> Result<String, LlmError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}
