use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use super::{Feed, SeedSummary, TutorStore, Update};
use crate::models::{
    BeginnerTopic, Call, CallPatch, CallStatus, NewCall, NewSession, Problem, SeedContent,
    SessionPatch, SessionStatus, Topic, TutorAvailability, TutoringSession, UserProgress,
};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    calls: HashMap<String, Call>,
    sessions: HashMap<String, TutoringSession>,
    progress: HashMap<String, UserProgress>,
    topics: HashMap<String, Topic>,
    problems: HashMap<String, Problem>,
    beginner_topics: HashMap<String, BeginnerTopic>,
    tutors: HashMap<String, TutorAvailability>,
}

/// Process-local store for development and tests. Change feeds are
/// broadcast channels.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    call_events: broadcast::Sender<Call>,
    session_events: broadcast::Sender<TutoringSession>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (call_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (session_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            call_events,
            session_events,
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn publish_call(&self, call: &Call) {
        // No subscribers is fine.
        let _ = self.call_events.send(call.clone());
    }

    fn publish_session(&self, session: &TutoringSession) {
        let _ = self.session_events.send(session.clone());
    }

    fn ringing_for(tables: &Tables, target_id: &str) -> Vec<Call> {
        let mut calls: Vec<Call> = tables
            .calls
            .values()
            .filter(|c| c.target_id == target_id && c.status == CallStatus::Ringing)
            .cloned()
            .collect();
        calls.sort_by_key(|c| c.created_at);
        calls
    }
}

fn receiver_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> impl Stream<Item = T> + Send {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Memory feed lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

#[async_trait]
impl TutorStore for MemoryStore {
    async fn create_call(&self, call: NewCall) -> Result<Call> {
        let now = Utc::now();
        let call = Call {
            id: Uuid::new_v4().to_string(),
            initiator_id: call.initiator_id,
            initiator_name: call.initiator_name,
            target_id: call.target_id,
            topic_id: call.topic_id,
            session_id: call.session_id,
            audio_room: call.audio_room,
            status: CallStatus::Ringing,
            ended_by: None,
            created_at: now,
            updated_at: now,
        };
        self.tables()?.calls.insert(call.id.clone(), call.clone());
        self.publish_call(&call);
        Ok(call)
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<Call>> {
        Ok(self.tables()?.calls.get(call_id).cloned())
    }

    async fn update_call(&self, call_id: &str, patch: CallPatch) -> Result<Update<Call>> {
        let updated = {
            let mut tables = self.tables()?;
            let Some(call) = tables.calls.get_mut(call_id) else {
                return Ok(Update::NotFound);
            };
            if let Some(next) = patch.status {
                if !call.status.can_transition_to(next) {
                    return Ok(Update::Rejected(call.clone()));
                }
                call.status = next;
            }
            if patch.ended_by.is_some() {
                call.ended_by = patch.ended_by;
            }
            call.updated_at = Utc::now();
            call.clone()
        };
        self.publish_call(&updated);
        Ok(Update::Applied(updated))
    }

    async fn ringing_calls_for(&self, target_id: &str) -> Result<Vec<Call>> {
        let tables = self.tables()?;
        Ok(Self::ringing_for(&tables, target_id))
    }

    async fn watch_call(&self, call_id: &str) -> Result<Feed<Call>> {
        let rx = self.call_events.subscribe();
        let initial = self.get_call(call_id).await?;
        let id = call_id.to_string();
        let updates = receiver_stream(rx).filter(move |c| futures::future::ready(c.id == id));
        Ok(stream::iter(initial).chain(updates).boxed())
    }

    async fn watch_incoming_calls(&self, target_id: &str) -> Result<Feed<Vec<Call>>> {
        let rx = self.call_events.subscribe();
        let initial = self.ringing_calls_for(target_id).await?;
        let store = self.clone();
        let target = target_id.to_string();
        let updates = receiver_stream(rx)
            .filter({
                let target = target.clone();
                move |c| futures::future::ready(c.target_id == target)
            })
            .filter_map(move |_| {
                let store = store.clone();
                let target = target.clone();
                async move { store.ringing_calls_for(&target).await.ok() }
            });
        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }

    async fn create_session(&self, session: NewSession) -> Result<TutoringSession> {
        let now = Utc::now();
        let session = TutoringSession {
            id: Uuid::new_v4().to_string(),
            student_id: session.student_id,
            tutor_id: session.tutor_id,
            topic_id: session.topic_id,
            status: SessionStatus::Calling,
            audio_room: session.audio_room,
            editor_room: session.editor_room,
            questions: Vec::new(),
            current_question_index: 0,
            current_difficulty: Default::default(),
            correct_count: 0,
            total_score: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.tables()?
            .sessions
            .insert(session.id.clone(), session.clone());
        self.publish_session(&session);
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<TutoringSession>> {
        Ok(self.tables()?.sessions.get(session_id).cloned())
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Update<TutoringSession>> {
        let updated = {
            let mut tables = self.tables()?;
            let Some(session) = tables.sessions.get_mut(session_id) else {
                return Ok(Update::NotFound);
            };
            if let Some(required) = patch.require_status {
                if session.status != required {
                    return Ok(Update::Rejected(session.clone()));
                }
            }
            patch.apply_to(session, Utc::now());
            session.clone()
        };
        self.publish_session(&updated);
        Ok(Update::Applied(updated))
    }

    async fn watch_session(&self, session_id: &str) -> Result<Feed<TutoringSession>> {
        let rx = self.session_events.subscribe();
        let initial = self.get_session(session_id).await?;
        let id = session_id.to_string();
        let updates = receiver_stream(rx).filter(move |s| futures::future::ready(s.id == id));
        Ok(stream::iter(initial).chain(updates).boxed())
    }

    async fn get_user_progress(&self, user_id: &str) -> Result<UserProgress> {
        Ok(self
            .tables()?
            .progress
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserProgress::empty(user_id)))
    }

    async fn complete_level(
        &self,
        user_id: &str,
        topic_id: &str,
        level: u8,
        score: u32,
    ) -> Result<UserProgress> {
        let mut tables = self.tables()?;
        let progress = tables
            .progress
            .entry(user_id.to_string())
            .or_insert_with(|| UserProgress::empty(user_id));
        progress.apply_level_completion(topic_id, level, score);
        Ok(progress.clone())
    }

    async fn complete_topic(
        &self,
        user_id: &str,
        topic_id: &str,
        session_id: &str,
        correct_count: u32,
    ) -> Result<u32> {
        let mut tables = self.tables()?;
        let progress = tables
            .progress
            .entry(user_id.to_string())
            .or_insert_with(|| UserProgress::empty(user_id));
        Ok(progress.apply_topic_completion(
            topic_id,
            session_id,
            correct_count,
            Utc::now(),
        ))
    }

    async fn get_topics(&self) -> Result<Vec<Topic>> {
        let mut topics: Vec<Topic> = self
            .tables()?
            .topics
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect();
        topics.sort_by_key(|t| t.order);
        Ok(topics)
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>> {
        Ok(self.tables()?.topics.get(topic_id).cloned())
    }

    async fn get_problems_for_level(&self, topic_id: &str, level: u8) -> Result<Vec<Problem>> {
        let mut problems: Vec<Problem> = self
            .tables()?
            .problems
            .values()
            .filter(|p| p.topic_id == topic_id && p.level == level)
            .cloned()
            .collect();
        problems.sort_by_key(|p| p.order);
        Ok(problems)
    }

    async fn get_beginner_topic(&self, topic_id: &str) -> Result<Option<BeginnerTopic>> {
        Ok(self.tables()?.beginner_topics.get(topic_id).cloned())
    }

    async fn seed_content(&self, content: SeedContent) -> Result<SeedSummary> {
        let summary = SeedSummary {
            topics: content.topics.len(),
            problems: content.problems.len(),
            beginner_topics: content.beginner_topics.len(),
        };
        let mut tables = self.tables()?;
        for topic in content.topics {
            tables.topics.insert(topic.id.clone(), topic);
        }
        for problem in content.problems {
            tables.problems.insert(problem.id.clone(), problem);
        }
        for topic in content.beginner_topics {
            tables.beginner_topics.insert(topic.id.clone(), topic);
        }
        Ok(summary)
    }

    async fn set_tutor_presence(&self, availability: TutorAvailability) -> Result<()> {
        self.tables()?
            .tutors
            .insert(availability.uid.clone(), availability);
        Ok(())
    }

    async fn online_tutors(&self) -> Result<Vec<TutorAvailability>> {
        let mut tutors: Vec<TutorAvailability> = self
            .tables()?
            .tutors
            .values()
            .filter(|t| t.is_online)
            .cloned()
            .collect();
        tutors.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(tutors)
    }

    async fn ping(&self) -> Result<()> {
        self.tables().map(|_| ())
    }
}
