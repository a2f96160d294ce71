use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::models::{
    BeginnerTopic, Call, CallPatch, NewCall, NewSession, Problem, SeedContent, SessionPatch, Topic,
    TutorAvailability, TutoringSession, UserProgress,
};

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Push feed of snapshots. Dropping the stream unsubscribes.
pub type Feed<T> = BoxStream<'static, T>;

/// Outcome of a guarded write.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    Applied(T),
    /// The stored document did not satisfy the write's precondition; carries
    /// the current state.
    Rejected(T),
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub topics: usize,
    pub problems: usize,
    pub beginner_topics: usize,
}

/// Persistence collaborator. Call status writes are applied only when the
/// stored status may move to the new one; session writes carrying
/// `SessionPatch::require_status` only when the stored phase matches.
#[async_trait]
pub trait TutorStore: Send + Sync {
    async fn create_call(&self, call: NewCall) -> Result<Call>;
    async fn get_call(&self, call_id: &str) -> Result<Option<Call>>;
    async fn update_call(&self, call_id: &str, patch: CallPatch) -> Result<Update<Call>>;
    async fn ringing_calls_for(&self, target_id: &str) -> Result<Vec<Call>>;
    /// Starts with the current snapshot, then every later write.
    async fn watch_call(&self, call_id: &str) -> Result<Feed<Call>>;
    /// Current list of ringing calls for a target, re-sent on every change.
    async fn watch_incoming_calls(&self, target_id: &str) -> Result<Feed<Vec<Call>>>;

    async fn create_session(&self, session: NewSession) -> Result<TutoringSession>;
    async fn get_session(&self, session_id: &str) -> Result<Option<TutoringSession>>;
    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Update<TutoringSession>>;
    async fn watch_session(&self, session_id: &str) -> Result<Feed<TutoringSession>>;

    async fn get_user_progress(&self, user_id: &str) -> Result<UserProgress>;
    /// Advances topic progress by one level and adds the score as XP.
    async fn complete_level(
        &self,
        user_id: &str,
        topic_id: &str,
        level: u8,
        score: u32,
    ) -> Result<UserProgress>;
    /// Marks a beginner topic complete and credits `correct_count * 10` XP;
    /// returns the XP. Keyed by session, so repeating it credits nothing more.
    async fn complete_topic(
        &self,
        user_id: &str,
        topic_id: &str,
        session_id: &str,
        correct_count: u32,
    ) -> Result<u32>;

    async fn get_topics(&self) -> Result<Vec<Topic>>;
    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>>;
    async fn get_problems_for_level(&self, topic_id: &str, level: u8) -> Result<Vec<Problem>>;
    async fn get_beginner_topic(&self, topic_id: &str) -> Result<Option<BeginnerTopic>>;
    async fn seed_content(&self, content: SeedContent) -> Result<SeedSummary>;

    async fn set_tutor_presence(&self, availability: TutorAvailability) -> Result<()>;
    async fn online_tutors(&self) -> Result<Vec<TutorAvailability>>;

    async fn ping(&self) -> Result<()>;
}

pub(crate) fn call_channel(call_id: &str) -> String {
    format!("call:{}", call_id)
}

pub(crate) fn session_channel(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub(crate) fn incoming_channel(target_id: &str) -> String {
    format!("incoming:{}", target_id)
}
