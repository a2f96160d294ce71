use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::SessionError;
use crate::metrics::SESSIONS_TOTAL;
use crate::models::session::{TransitionOutcome, TransitionResponse};
use crate::models::{
    can_perform, NewSession, Role, SessionOperation, SessionPatch, SessionStatus,
    TutoringSession,
};
use crate::services::store::{TutorStore, Update};

/// Enforces the calling → teaching → quiz → completed progression and the
/// role/phase gate on every session operation.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn TutorStore>,
}

impl SessionService {
    pub fn new(store: Arc<dyn TutorStore>) -> Self {
        Self { store }
    }

    /// New session in `calling` with fresh audio and editor rooms.
    pub async fn create(
        &self,
        student_id: &str,
        tutor_id: &str,
        topic_id: &str,
    ) -> Result<TutoringSession, SessionError> {
        let room_id = Uuid::new_v4();
        let session = self
            .store
            .create_session(NewSession {
                student_id: student_id.to_string(),
                tutor_id: tutor_id.to_string(),
                topic_id: topic_id.to_string(),
                audio_room: format!("session-{}", room_id),
                editor_room: format!("beginner-session-{}", room_id),
            })
            .await
            .map_err(SessionError::Store)?;

        SESSIONS_TOTAL
            .with_label_values(&[SessionStatus::Calling.as_str()])
            .inc();
        tracing::info!(
            "Created session {} (student={}, tutor={}, topic={})",
            session.id,
            student_id,
            tutor_id,
            topic_id
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<TutoringSession, SessionError> {
        self.store
            .get_session(session_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Loads the session and checks that `actor_id` may perform `operation`
    /// in its current phase.
    pub async fn authorize(
        &self,
        session_id: &str,
        actor_id: &str,
        operation: SessionOperation,
    ) -> Result<(TutoringSession, Role), SessionError> {
        let session = self.get(session_id).await?;
        let role = participant_role(&session, actor_id)?;
        if !can_perform(operation, role, session.status) {
            return Err(SessionError::Forbidden {
                operation,
                role,
                phase: session.status,
            });
        }
        Ok((session, role))
    }

    /// Side effect of an accepted call. Safe to repeat.
    pub async fn mark_teaching(&self, session_id: &str) -> Result<TransitionOutcome, SessionError> {
        let (_, outcome) = self
            .advance(session_id, SessionStatus::Calling, SessionStatus::Teaching)
            .await?;
        Ok(outcome)
    }

    pub async fn start_quiz(
        &self,
        session_id: &str,
        actor_id: &str,
    ) -> Result<TransitionResponse, SessionError> {
        let session = self.get(session_id).await?;
        let role = participant_role(&session, actor_id)?;

        // A repeated request from the tutor after the quiz began is a no-op.
        if role == Role::Tutor && session.status >= SessionStatus::Quiz {
            return Ok(TransitionResponse {
                session_id: session.id,
                status: session.status,
                outcome: TransitionOutcome::AlreadyApplied,
            });
        }
        if !can_perform(SessionOperation::StartQuiz, role, session.status) {
            return Err(SessionError::Forbidden {
                operation: SessionOperation::StartQuiz,
                role,
                phase: session.status,
            });
        }

        let (session, outcome) = self
            .advance(session_id, SessionStatus::Teaching, SessionStatus::Quiz)
            .await?;
        Ok(TransitionResponse {
            session_id: session.id,
            status: session.status,
            outcome,
        })
    }

    /// Writes quiz round state; lands only while the session is in `quiz`.
    pub async fn record_quiz_round(
        &self,
        session_id: &str,
        mut patch: SessionPatch,
    ) -> Result<Option<TutoringSession>, SessionError> {
        patch.require_status = Some(SessionStatus::Quiz);
        match self
            .store
            .update_session(session_id, patch)
            .await
            .map_err(SessionError::Store)?
        {
            Update::Applied(session) => Ok(Some(session)),
            Update::Rejected(session) => {
                tracing::warn!(
                    "Quiz round for session {} dropped: session is {:?}",
                    session_id,
                    session.status
                );
                Ok(None)
            }
            Update::NotFound => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    /// Finishes the quiz and awards `correct_count * 10` XP to the student.
    /// Returns the XP, or `None` when the session was already completed.
    ///
    /// XP is credited before the session leaves `quiz`, and the credit is
    /// keyed by session, so a failed write can be retried without losing or
    /// doubling the award.
    pub async fn complete_quiz(
        &self,
        session_id: &str,
        correct_count: u32,
    ) -> Result<Option<u32>, SessionError> {
        let session = self.get(session_id).await?;
        match session.status {
            SessionStatus::Quiz => {}
            SessionStatus::Completed => return Ok(None),
            phase => {
                return Err(SessionError::Forbidden {
                    operation: SessionOperation::CompleteQuiz,
                    role: Role::Student,
                    phase,
                })
            }
        }

        let xp = self
            .store
            .complete_topic(
                &session.student_id,
                &session.topic_id,
                &session.id,
                correct_count,
            )
            .await
            .map_err(SessionError::Store)?;

        let patch = SessionPatch {
            correct_count: Some(correct_count),
            total_score: Some(correct_count),
            completed_at: Some(Utc::now()),
            ..SessionPatch::transition(SessionStatus::Quiz, SessionStatus::Completed)
        };
        match self
            .store
            .update_session(session_id, patch)
            .await
            .map_err(SessionError::Store)?
        {
            Update::Applied(_) => {}
            Update::Rejected(current) if current.status == SessionStatus::Completed => {
                return Ok(None)
            }
            Update::Rejected(current) => {
                return Err(SessionError::Forbidden {
                    operation: SessionOperation::CompleteQuiz,
                    role: Role::Student,
                    phase: current.status,
                })
            }
            Update::NotFound => return Err(SessionError::NotFound(session_id.to_string())),
        }

        SESSIONS_TOTAL
            .with_label_values(&[SessionStatus::Completed.as_str()])
            .inc();
        tracing::info!(
            "Session {} completed: {}/{} correct, {} XP to {}",
            session.id,
            correct_count,
            session.questions.len(),
            xp,
            session.student_id
        );
        Ok(Some(xp))
    }

    async fn advance(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<(TutoringSession, TransitionOutcome), SessionError> {
        match self
            .store
            .update_session(session_id, SessionPatch::transition(from, to))
            .await
            .map_err(SessionError::Store)?
        {
            Update::Applied(session) => {
                SESSIONS_TOTAL.with_label_values(&[to.as_str()]).inc();
                tracing::info!("Session {} moved {:?} -> {:?}", session_id, from, to);
                Ok((session, TransitionOutcome::Applied))
            }
            Update::Rejected(session) if session.status >= to => {
                tracing::debug!("Session {} already at {:?}", session_id, session.status);
                Ok((session, TransitionOutcome::AlreadyApplied))
            }
            Update::Rejected(session) => Err(SessionError::Forbidden {
                operation: match to {
                    SessionStatus::Teaching => SessionOperation::AcceptCall,
                    SessionStatus::Quiz => SessionOperation::StartQuiz,
                    _ => SessionOperation::CompleteQuiz,
                },
                role: Role::Tutor,
                phase: session.status,
            }),
            Update::NotFound => Err(SessionError::NotFound(session_id.to_string())),
        }
    }
}

fn participant_role(session: &TutoringSession, actor_id: &str) -> Result<Role, SessionError> {
    session
        .role_of(actor_id)
        .ok_or_else(|| SessionError::NotParticipant {
            session_id: session.id.clone(),
            actor_id: actor_id.to_string(),
        })
}
