use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::errors::LlmError;
use crate::models::assessment::AssessmentVerdict;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap();
    static ref JSON_FENCED_BLOCK: Regex = Regex::new(r"(?s)```json\s*(.*?)```").unwrap();
    static ref OBJECT_SPAN: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// Pulls the JSON object out of a model reply: the first fenced block if
/// there is one, otherwise the outermost `{...}` span.
pub fn extract_json(raw: &str) -> &str {
    let mut text = raw.trim();

    if let Some(inner) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        text = inner.as_str().trim();
    }

    if !text.starts_with('{') {
        if let Some(span) = OBJECT_SPAN.find(text) {
            text = span.as_str();
        }
    }

    text
}

pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    serde_json::from_str(extract_json(raw)).map_err(|e| LlmError::Malformed(e.to_string()))
}

/// The verdict block an assessor appends to its streamed answer. `None` when
/// the reply has no parsable ```json block.
pub fn parse_verdict(reply: &str) -> Option<AssessmentVerdict> {
    let block = JSON_FENCED_BLOCK.captures(reply)?.get(1)?;
    match serde_json::from_str(block.as_str().trim()) {
        Ok(verdict) => Some(verdict),
        Err(e) => {
            tracing::debug!("Assessor verdict block unreadable: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvaluationReply;

    #[test]
    fn fenced_block_wins() {
        let raw = "Here you go:\n```json\n{\"passed\": true, \"feedback\": \"Nice\"}\n```\nBye";
        let reply: EvaluationReply = parse_structured(raw).unwrap();
        assert!(reply.passed);
        assert_eq!(reply.feedback, "Nice");
    }

    #[test]
    fn bare_object_is_found_inside_prose() {
        let raw = "Sure! {\"passed\": false, \"feedback\": \"Check the loop\", \"correctCount\": 1, \"totalTests\": 3} hope that helps";
        let reply: EvaluationReply = parse_structured(raw).unwrap();
        assert!(!reply.passed);
        assert_eq!(reply.correct_count, 1);
        assert_eq!(reply.total_tests, 3);
    }

    #[test]
    fn prose_without_json_is_malformed() {
        let err = parse_structured::<EvaluationReply>("I think it works").unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[test]
    fn verdict_requires_json_fence() {
        let reply = "Great work on the loop!\n\n```json\n{\"passed\": true, \"feedback\": \"Clean solution\", \"creativityScore\": 35, \"approachLabel\": \"reduce\", \"hintsUsed\": 1}\n```";
        let verdict = parse_verdict(reply).unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.creativity_points(), 35);
        assert_eq!(verdict.approach_label.as_deref(), Some("reduce"));

        assert!(parse_verdict("{\"passed\": true}").is_none());
        assert!(parse_verdict("```json\nnot json\n```").is_none());
    }

    #[test]
    fn fractional_creativity_is_rounded_and_clamped() {
        let verdict =
            parse_verdict("```json\n{\"passed\": true, \"creativityScore\": 7.5}\n```").unwrap();
        assert_eq!(verdict.creativity_points(), 8);

        let verdict =
            parse_verdict("```json\n{\"passed\": true, \"creativityScore\": -3}\n```").unwrap();
        assert_eq!(verdict.creativity_points(), 0);

        let verdict =
            parse_verdict("```json\n{\"passed\": true, \"creativityScore\": 80.2}\n```").unwrap();
        assert_eq!(verdict.creativity_points(), 50);
    }
}
