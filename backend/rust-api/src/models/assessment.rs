use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content::LevelType;
use super::quiz::{TestCase, TestResult, TestRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmittedSolution {
    pub solution_number: u32,
    pub code: String,
    pub approach: String,
}

/// Verdict block the assessor appends to its streamed answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentVerdict {
    pub passed: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub creativity_score: f64,
    #[serde(default)]
    pub approach_label: Option<String>,
    #[serde(default)]
    pub hints_used: u32,
}

impl AssessmentVerdict {
    /// Creativity rounded into the 0..=50 bonus range. Models sometimes send
    /// fractional or negative scores.
    pub fn creativity_points(&self) -> u32 {
        if self.creativity_score.is_finite() {
            self.creativity_score.round().clamp(0.0, 50.0) as u32
        } else {
            0
        }
    }
}

/// Everything the assessor and the chat tutor see about an attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentContext {
    pub topic: String,
    pub level: u8,
    pub level_type: LevelType,
    pub problem_title: String,
    pub problem_description: String,
    pub test_cases: Vec<TestCase>,
    pub student_code: String,
    pub attempt_number: u32,
    pub test_results: Vec<TestResult>,
    pub constraints: Vec<String>,
    pub required_solutions: Option<u32>,
    pub submitted_solutions: Vec<SubmittedSolution>,
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatContext {
    pub assessment: AssessmentContext,
    pub user_message: String,
}

/// Points awarded for a completed level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base_points: u32,
    pub attempt_multiplier: f64,
    pub creativity_bonus: u32,
    pub speed_bonus: u32,
    pub final_score: u32,
}

#[derive(Debug, Deserialize)]
pub struct StartAttemptRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AttemptCodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct AttemptChatRequest {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptView {
    pub attempt_id: String,
    pub user_id: String,
    pub topic_id: String,
    pub level: u8,
    pub level_type: LevelType,
    pub problem_title: String,
    pub problem_description: String,
    pub constraints: Vec<String>,
    pub required_solutions: Option<u32>,
    pub visible_test_cases: Vec<TestCase>,
    pub code: String,
    pub attempt_count: u32,
    pub last_run: Option<TestRun>,
    pub messages: Vec<ChatMessage>,
    pub completed: bool,
    pub score: Option<ScoreBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Submit before any run; nothing was sent to the assessor.
    RunFirst { message: String },
    Passed {
        feedback: String,
        verdict_source: VerdictSource,
        score: ScoreBreakdown,
        elapsed_seconds: u64,
    },
    NotYet {
        feedback: String,
        verdict_source: VerdictSource,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Assessor,
    LocalTests,
}
