use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quiz::{Difficulty, QuestionRecord};

/// Phase of a tutoring session. Ordered: a session only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Calling,
    Teaching,
    Quiz,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calling => "calling",
            Self::Teaching => "teaching",
            Self::Quiz => "quiz",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Tutor,
}

/// Operations gated by role and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOperation {
    AcceptCall,
    Collaborate,
    StartQuiz,
    DriveQuiz,
    CompleteQuiz,
    Observe,
}

impl SessionOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcceptCall => "accept_call",
            Self::Collaborate => "collaborate",
            Self::StartQuiz => "start_quiz",
            Self::DriveQuiz => "drive_quiz",
            Self::CompleteQuiz => "complete_quiz",
            Self::Observe => "observe",
        }
    }
}

/// Writes to the shared session document are partitioned by phase and role
/// instead of by lock.
pub const fn can_perform(operation: SessionOperation, role: Role, phase: SessionStatus) -> bool {
    use SessionOperation as Op;

    match operation {
        Op::AcceptCall => matches!((role, phase), (Role::Tutor, SessionStatus::Calling)),
        Op::Collaborate => matches!(phase, SessionStatus::Teaching),
        Op::StartQuiz => matches!((role, phase), (Role::Tutor, SessionStatus::Teaching)),
        Op::DriveQuiz | Op::CompleteQuiz => {
            matches!((role, phase), (Role::Student, SessionStatus::Quiz))
        }
        Op::Observe => true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TutoringSession {
    pub id: String,
    pub student_id: String,
    pub tutor_id: String,
    pub topic_id: String,
    pub status: SessionStatus,
    pub audio_room: String,
    pub editor_room: String,
    #[serde(default)]
    pub questions: Vec<QuestionRecord>,
    #[serde(default)]
    pub current_question_index: u32,
    #[serde(default)]
    pub current_difficulty: Difficulty,
    #[serde(default)]
    pub correct_count: u32,
    #[serde(default)]
    pub total_score: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TutoringSession {
    pub fn role_of(&self, actor_id: &str) -> Option<Role> {
        if actor_id == self.student_id {
            Some(Role::Student)
        } else if actor_id == self.tutor_id {
            Some(Role::Tutor)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub student_id: String,
    pub tutor_id: String,
    pub topic_id: String,
    pub audio_room: String,
    pub editor_room: String,
}

/// Partial update of a session document. `append_question` is pushed onto
/// the question list; nothing ever rewrites recorded questions. When
/// `require_status` is set the write only lands in that phase.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub require_status: Option<SessionStatus>,
    pub status: Option<SessionStatus>,
    pub append_question: Option<QuestionRecord>,
    pub current_question_index: Option<u32>,
    pub current_difficulty: Option<Difficulty>,
    pub correct_count: Option<u32>,
    pub total_score: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// Move from `from` to `to`, only if the session is still in `from`.
    pub fn transition(from: SessionStatus, to: SessionStatus) -> Self {
        Self {
            require_status: Some(from),
            status: Some(to),
            ..Self::default()
        }
    }

    /// Apply this patch to an in-memory copy.
    pub fn apply_to(self, session: &mut TutoringSession, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(record) = self.append_question {
            session.questions.push(record);
        }
        if let Some(index) = self.current_question_index {
            session.current_question_index = index;
        }
        if let Some(difficulty) = self.current_difficulty {
            session.current_difficulty = difficulty;
        }
        if let Some(correct) = self.correct_count {
            session.correct_count = correct;
        }
        if let Some(score) = self.total_score {
            session.total_score = score;
        }
        if let Some(at) = self.completed_at {
            session.completed_at = Some(at);
        }
        session.updated_at = now;
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionActionRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub outcome: TransitionOutcome,
}
