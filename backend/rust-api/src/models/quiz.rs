use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Three-rung difficulty ladder used by the adaptive quiz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const fn step_up(self) -> Self {
        match self {
            Self::Easy => Self::Medium,
            Self::Medium | Self::Hard => Self::Hard,
        }
    }

    pub const fn step_down(self) -> Self {
        match self {
            Self::Hard => Self::Medium,
            Self::Medium | Self::Easy => Self::Easy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: Value,
    #[serde(alias = "expectedOutput")]
    pub expected_output: Value,
    #[serde(default, alias = "isHidden")]
    pub is_hidden: bool,
}

impl TestCase {
    /// Generated content sometimes carries JSON-encoded strings instead of
    /// structured values; decode them when they parse.
    fn decode_embedded_json(value: Value) -> Value {
        match value {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            other => other,
        }
    }

    pub fn normalized(mut self, position: usize) -> Self {
        if self.id.is_empty() {
            self.id = (position + 1).to_string();
        }
        self.input = Self::decode_embedded_json(self.input);
        self.expected_output = Self::decode_embedded_json(self.expected_output);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub test_case_id: String,
    pub description: String,
    pub passed: bool,
    pub actual: Value,
    pub expected: Value,
    pub error: Option<String>,
}

/// Outcome of one local run: per-case results, or a top-level error when the
/// code could not be loaded or the function is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestRun {
    pub results: Vec<TestResult>,
    pub error: Option<String>,
}

impl TestRun {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.passed)
    }
}

/// Outcome of one adaptive-quiz question; immutable once appended to a
/// session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionRecord {
    pub index: u32,
    pub prompt: String,
    pub function_name: String,
    pub difficulty: Difficulty,
    pub topics_tested: Vec<String>,
    pub test_cases: Vec<TestCase>,
    pub student_code: String,
    pub passed: Option<bool>,
    pub feedback: String,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviousQuestion {
    pub prompt: String,
    pub function_name: String,
}

/// Question returned by the LLM collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuestion {
    pub question: String,
    pub function_name: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub topics_tested: Vec<String>,
}

impl GeneratedQuestion {
    pub fn normalized(mut self) -> Self {
        self.test_cases = self
            .test_cases
            .into_iter()
            .enumerate()
            .map(|(i, tc)| tc.normalized(i))
            .collect();
        self
    }

    pub fn visible_test_cases(&self) -> Vec<TestCase> {
        self.test_cases
            .iter()
            .filter(|tc| !tc.is_hidden)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionRequest {
    pub topic_id: String,
    pub topic_title: String,
    pub cumulative_topics: Vec<String>,
    pub difficulty: Difficulty,
    pub question_index: u32,
    pub total_questions: u32,
    pub previous_questions: Vec<PreviousQuestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequest {
    pub question: String,
    pub function_name: String,
    pub test_cases: Vec<TestCase>,
    pub student_code: String,
    pub attempt_number: u32,
}

/// Structured verdict from the evaluation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReply {
    pub passed: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub failed_tests: Vec<String>,
    #[serde(default)]
    pub correct_count: u32,
    #[serde(default)]
    pub total_tests: u32,
}

#[derive(Debug, Deserialize)]
pub struct QuizActionRequest {
    pub actor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct QuizCodeRequest {
    pub actor_id: String,
    pub code: String,
}

/// Client view of the active question; hidden cases stay server-side.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub index: u32,
    pub total_questions: u32,
    pub question: String,
    pub function_name: String,
    pub hint: String,
    pub difficulty: Difficulty,
    pub topics_tested: Vec<String>,
    pub test_cases: Vec<TestCase>,
    pub starter_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Passed,
    Exhausted,
    Retry,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: TestRun,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReport {
    pub outcome: RoundOutcome,
    pub passed: bool,
    pub feedback: String,
    pub attempt_count: u32,
    pub correct_count: u32,
    pub difficulty: Difficulty,
    pub next_question_index: Option<u32>,
    pub quiz_completed: bool,
    pub advance_after_ms: Option<u64>,
    pub xp_earned: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuizSnapshot {
    pub session_id: String,
    pub question_index: u32,
    pub total_questions: u32,
    pub difficulty: Difficulty,
    pub correct_count: u32,
    pub attempt_count: u32,
    pub question_results: Vec<Option<bool>>,
    pub current_question: Option<QuestionView>,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ladder_is_capped_at_both_ends() {
        assert_eq!(Difficulty::Easy.step_up(), Difficulty::Medium);
        assert_eq!(Difficulty::Hard.step_up(), Difficulty::Hard);
        assert_eq!(Difficulty::Hard.step_down(), Difficulty::Medium);
        assert_eq!(Difficulty::Easy.step_down(), Difficulty::Easy);
    }

    #[test]
    fn generated_question_is_normalized() {
        let raw = json!({
            "question": "Double every number",
            "functionName": "doubleAll",
            "testCases": [
                { "description": "basic", "input": "[[1,2,3]]", "expectedOutput": "[2,4,6]" },
                { "id": "h", "description": "hidden", "input": [[0]], "expectedOutput": [0], "isHidden": true }
            ],
            "difficulty": "easy",
            "topicsTested": ["arrays"]
        });

        let question: GeneratedQuestion = serde_json::from_value(raw).unwrap();
        let question = question.normalized();

        assert_eq!(question.test_cases[0].id, "1");
        assert_eq!(question.test_cases[0].input, json!([[1, 2, 3]]));
        assert_eq!(question.test_cases[0].expected_output, json!([2, 4, 6]));
        assert!(!question.test_cases[0].is_hidden);
        assert_eq!(question.test_cases[1].id, "h");
        assert_eq!(question.visible_test_cases().len(), 1);
    }

    #[test]
    fn plain_strings_survive_normalization() {
        let tc = TestCase {
            id: String::new(),
            description: "greets".into(),
            input: json!("Ada"),
            expected_output: json!("Hello, Ada"),
            is_hidden: false,
        }
        .normalized(2);

        assert_eq!(tc.id, "3");
        assert_eq!(tc.input, json!("Ada"));
        assert_eq!(tc.expected_output, json!("Hello, Ada"));
    }
}
