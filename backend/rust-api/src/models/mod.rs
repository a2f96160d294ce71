pub mod assessment;
pub mod call;
pub mod content;
pub mod progress;
pub mod quiz;
pub mod session;
pub mod transport;

pub use call::{Call, CallPatch, CallStatus, NewCall};
pub use content::{BeginnerTopic, LevelType, Problem, SeedContent, Topic};
pub use progress::{TutorAvailability, UserProgress};
pub use quiz::{
    Difficulty, EvaluationReply, EvaluationRequest, GeneratedQuestion, PreviousQuestion,
    QuestionRecord, QuestionRequest, TestCase, TestResult, TestRun,
};
pub use session::{
    can_perform, NewSession, Role, SessionOperation, SessionPatch, SessionStatus, TutoringSession,
};
