use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::VecDeque;

use super::json::parse_structured;
use super::prompts::{
    assessment_prompt, chat_prompt, evaluation_prompt, question_prompt, BEGINNER_SYSTEM_PROMPT,
    TUTOR_SYSTEM_PROMPT,
};
use super::{TextStream, TutorLlm};
use crate::config::Config;
use crate::errors::LlmError;
use crate::metrics::record_llm_request;
use crate::models::assessment::{AssessmentContext, ChatContext};
use crate::models::quiz::{EvaluationReply, EvaluationRequest, GeneratedQuestion, QuestionRequest};
use crate::utils::retry::{retry_async_when, RetryConfig};

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .map(|p| p.text.as_str())
            .collect()
    }
}

struct Call<'a> {
    operation: &'static str,
    system: &'a str,
    prompt: &'a str,
    temperature: f32,
    max_output_tokens: u32,
    json_mode: bool,
}

/// Gemini REST client.
#[derive(Clone)]
pub struct GeminiTutor {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl GeminiTutor {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            base_url: config.gemini_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.api_key
            .as_deref()
            .ok_or(LlmError::NotConfigured("GEMINI_API_KEY"))
    }

    fn body<'a>(call: &Call<'a>) -> GenerateRequest<'a> {
        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: [Part { text: call.system }],
            },
            contents: [Content {
                role: Some("user"),
                parts: [Part { text: call.prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: call.temperature,
                max_output_tokens: call.max_output_tokens,
                response_mime_type: call.json_mode.then_some("application/json"),
            },
        }
    }

    async fn send(&self, call: &Call<'_>, method: &str) -> Result<reqwest::Response, LlmError> {
        let key = self.api_key()?;
        let url = format!("{}/models/{}:{}", self.base_url, self.model, method);
        tracing::debug!(operation = call.operation, "Calling Gemini {}", method);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(&Self::body(call))
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn generate_text(&self, call: &Call<'_>) -> Result<String, LlmError> {
        let reply: GenerateResponse = self
            .send(call, "generateContent")
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(reply.text())
    }

    /// Three tries, back to back; any failure but missing credentials is
    /// retried and the last error is returned.
    async fn structured<T: DeserializeOwned>(&self, call: Call<'_>) -> Result<T, LlmError> {
        let mut attempt = 0;
        let result = retry_async_when(
            RetryConfig::structured_reply(),
            || {
                attempt += 1;
                let n = attempt;
                let call = &call;
                async move {
                    let outcome = self
                        .generate_text(call)
                        .await
                        .and_then(|raw| parse_structured::<T>(&raw));
                    if let Err(e) = &outcome {
                        tracing::warn!("{} attempt {}/3 failed: {}", call.operation, n, e);
                    }
                    outcome
                }
            },
            LlmError::is_retryable,
        )
        .await;

        record_llm_request(call.operation, &result);
        result
    }

    async fn stream_text(&self, call: Call<'_>) -> Result<TextStream, LlmError> {
        let response = self.send(&call, "streamGenerateContent?alt=sse").await;
        record_llm_request(call.operation, &response);
        Ok(sse_text_stream(response?.bytes_stream()))
    }
}

/// Turns a `text/event-stream` body of GenerateContent responses into text
/// chunks. Bytes are buffered until a full line arrives so multi-byte
/// characters split across network chunks decode intact.
fn sse_text_stream<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream::unfold(
        (bytes.boxed(), Vec::<u8>::new(), VecDeque::<String>::new(), false),
        |(mut bytes, mut buffer, mut ready, mut done)| async move {
            loop {
                if let Some(text) = ready.pop_front() {
                    return Some((Ok(text), (bytes, buffer, ready, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(chunk.as_ref());
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            if let Some(text) = sse_data_text(String::from_utf8_lossy(&line).trim())
                            {
                                ready.push_back(text);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(LlmError::Transport(e.to_string())),
                            (bytes, buffer, ready, done),
                        ));
                    }
                    None => {
                        done = true;
                        if let Some(text) = sse_data_text(String::from_utf8_lossy(&buffer).trim()) {
                            ready.push_back(text);
                        }
                        buffer.clear();
                    }
                }
            }
        },
    )
    .boxed()
}

fn sse_data_text(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?.trim();
    let reply: GenerateResponse = serde_json::from_str(payload).ok()?;
    let text = reply.text();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl TutorLlm for GeminiTutor {
    async fn generate_question(
        &self,
        request: &QuestionRequest,
    ) -> Result<GeneratedQuestion, LlmError> {
        let prompt = question_prompt(request);
        let question: GeneratedQuestion = self
            .structured(Call {
                operation: "generate_question",
                system: BEGINNER_SYSTEM_PROMPT,
                prompt: &prompt,
                temperature: 0.7,
                max_output_tokens: 1024,
                json_mode: true,
            })
            .await?;
        Ok(question.normalized())
    }

    async fn evaluate_submission(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationReply, LlmError> {
        let prompt = evaluation_prompt(request);
        self.structured(Call {
            operation: "evaluate_submission",
            system: BEGINNER_SYSTEM_PROMPT,
            prompt: &prompt,
            temperature: 0.4,
            max_output_tokens: 512,
            json_mode: false,
        })
        .await
    }

    async fn assess_level_submission(
        &self,
        context: &AssessmentContext,
    ) -> Result<TextStream, LlmError> {
        let prompt = assessment_prompt(context);
        self.stream_text(Call {
            operation: "assess_level_submission",
            system: TUTOR_SYSTEM_PROMPT,
            prompt: &prompt,
            temperature: 0.7,
            max_output_tokens: 1024,
            json_mode: false,
        })
        .await
    }

    async fn chat_reply(&self, context: &ChatContext) -> Result<TextStream, LlmError> {
        let prompt = chat_prompt(context);
        self.stream_text(Call {
            operation: "chat_reply",
            system: TUTOR_SYSTEM_PROMPT,
            prompt: &prompt,
            temperature: 0.7,
            max_output_tokens: 1024,
            json_mode: false,
        })
        .await
    }
}
