use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::{LlmError, QuizError, SessionError};
use crate::metrics::QUIZ_ROUNDS_TOTAL;
use crate::models::content::starter_template;
use crate::models::quiz::{QuestionView, QuizSnapshot, RoundOutcome, RunReport, SubmitReport};
use crate::models::{
    Difficulty, EvaluationRequest, GeneratedQuestion, PreviousQuestion, QuestionRecord,
    QuestionRequest, Role, SessionOperation, SessionPatch, SessionStatus, TestRun, TutoringSession,
};
use crate::services::llm::TutorLlm;
use crate::services::session_service::SessionService;
use crate::services::store::TutorStore;
use crate::services::test_runner::TestRunner;

/// Consecutive same-direction outcomes needed to move difficulty.
pub const DIFFICULTY_STREAK: u32 = 2;
pub const ADVANCE_AFTER_PASS_MS: u64 = 2000;
pub const ADVANCE_AFTER_EXHAUSTED_MS: u64 = 2500;
/// Quiz state nobody has touched for this long is dropped; the persisted
/// session is enough to resume it.
pub const QUIZ_IDLE_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    Next(u32),
    Complete { correct_count: u32 },
}

/// Round bookkeeping for one quiz: results, streaks and the difficulty
/// ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct QuizProgress {
    pub question_index: u32,
    pub total_questions: u32,
    pub difficulty: Difficulty,
    pub correct_count: u32,
    pub consecutive_correct: u32,
    pub consecutive_wrong: u32,
    pub question_results: Vec<Option<bool>>,
    pub completed: bool,
}

impl QuizProgress {
    pub fn new(total_questions: u32) -> Self {
        Self {
            question_index: 0,
            total_questions,
            difficulty: Difficulty::Easy,
            correct_count: 0,
            consecutive_correct: 0,
            consecutive_wrong: 0,
            question_results: vec![None; total_questions as usize],
            completed: false,
        }
    }

    /// Rebuilds progress from a persisted session.
    pub fn resume(session: &TutoringSession, total_questions: u32) -> Self {
        let mut progress = Self::new(total_questions);
        for record in &session.questions {
            if let (Some(slot), Some(passed)) = (
                progress.question_results.get_mut(record.index as usize),
                record.passed,
            ) {
                *slot = Some(passed);
                progress.bump_streaks(passed);
            }
        }
        progress.question_index = session.current_question_index;
        progress.difficulty = session.current_difficulty;
        progress.correct_count = session.correct_count;
        progress.completed = session.status == SessionStatus::Completed;
        progress
    }

    fn bump_streaks(&mut self, passed: bool) -> Option<Difficulty> {
        if passed {
            self.consecutive_correct += 1;
            self.consecutive_wrong = 0;
            if self.consecutive_correct >= DIFFICULTY_STREAK {
                self.consecutive_correct = 0;
                return Some(self.difficulty.step_up());
            }
        } else {
            self.consecutive_wrong += 1;
            self.consecutive_correct = 0;
            if self.consecutive_wrong >= DIFFICULTY_STREAK {
                self.consecutive_wrong = 0;
                return Some(self.difficulty.step_down());
            }
        }
        None
    }

    /// Finalises the current round. `None` once the quiz is complete, so
    /// completion is reported exactly once.
    pub fn record(&mut self, passed: bool) -> Option<RoundAdvance> {
        if self.completed {
            return None;
        }
        if let Some(slot) = self.question_results.get_mut(self.question_index as usize) {
            *slot = Some(passed);
        }
        if passed {
            self.correct_count += 1;
        }
        if let Some(difficulty) = self.bump_streaks(passed) {
            self.difficulty = difficulty;
        }

        if self.question_index + 1 >= self.total_questions {
            self.completed = true;
            Some(RoundAdvance::Complete {
                correct_count: self.correct_count,
            })
        } else {
            self.question_index += 1;
            Some(RoundAdvance::Next(self.question_index))
        }
    }
}

struct ActiveQuestion {
    question: GeneratedQuestion,
    difficulty: Difficulty,
    attempt_count: u32,
    last_run: Option<TestRun>,
}

struct QuizState {
    progress: QuizProgress,
    current: Option<ActiveQuestion>,
    asked: Vec<PreviousQuestion>,
    /// Set while a model call or code run for this round is outstanding.
    in_flight: bool,
    last_active: Instant,
}

impl QuizState {
    fn resume(session: &TutoringSession, total_questions: u32) -> Self {
        Self {
            progress: QuizProgress::resume(session, total_questions),
            current: None,
            asked: session
                .questions
                .iter()
                .map(|q| PreviousQuestion {
                    prompt: q.prompt.clone(),
                    function_name: q.function_name.clone(),
                })
                .collect(),
            in_flight: false,
            last_active: Instant::now(),
        }
    }

    fn ensure_idle(&self) -> Result<(), QuizError> {
        if self.progress.completed {
            return Err(QuizError::Finished);
        }
        if self.in_flight {
            return Err(QuizError::RoundInFlight);
        }
        Ok(())
    }

    fn view(&self) -> Option<QuestionView> {
        let active = self.current.as_ref()?;
        let q = &active.question;
        Some(QuestionView {
            index: self.progress.question_index,
            total_questions: self.progress.total_questions,
            question: q.question.clone(),
            function_name: q.function_name.clone(),
            hint: q.hint.clone(),
            difficulty: active.difficulty,
            topics_tested: q.topics_tested.clone(),
            test_cases: q.visible_test_cases(),
            starter_code: starter_template(&q.function_name),
        })
    }

    fn snapshot(&self, session: &TutoringSession) -> QuizSnapshot {
        QuizSnapshot {
            session_id: session.id.clone(),
            question_index: self.progress.question_index,
            total_questions: self.progress.total_questions,
            difficulty: self.progress.difficulty,
            correct_count: self.progress.correct_count,
            attempt_count: self.current.as_ref().map_or(0, |a| a.attempt_count),
            question_results: self.progress.question_results.clone(),
            current_question: self.view(),
            completed: self.progress.completed || session.status == SessionStatus::Completed,
        }
    }
}

type QuizStates = Arc<Mutex<HashMap<String, QuizState>>>;

fn lock_states(states: &QuizStates) -> MutexGuard<'_, HashMap<String, QuizState>> {
    states
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops quizzes abandoned mid-way. Rounds still in flight are kept.
fn prune_idle(states: &mut HashMap<String, QuizState>, now: Instant) {
    let before = states.len();
    states.retain(|_, state| {
        state.in_flight || now.duration_since(state.last_active) < QUIZ_IDLE_RETENTION
    });
    let dropped = before - states.len();
    if dropped > 0 {
        tracing::debug!("Dropped {} idle quiz states", dropped);
    }
}

/// Clears a round's in-flight mark when dropped, so a request abandoned
/// mid-await does not wedge the quiz.
struct RoundGuard {
    states: QuizStates,
    session_id: String,
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        if let Some(state) = lock_states(&self.states).get_mut(&self.session_id) {
            state.in_flight = false;
        }
    }
}

struct QuestionInputs {
    difficulty: Difficulty,
    question_index: u32,
    total_questions: u32,
    previous_questions: Vec<PreviousQuestion>,
}

enum LoadPlan {
    Open(QuestionView),
    Fetch(QuestionInputs),
    /// Every round is recorded but the session never reached `completed`.
    Finish(u32),
}

enum Settled {
    Retry {
        correct_count: u32,
        difficulty: Difficulty,
    },
    Closed {
        index: u32,
        advance: RoundAdvance,
        patch: SessionPatch,
        progress: QuizProgress,
    },
}

/// Drives the adaptive quiz of each session in `quiz`. Quiz state sits
/// behind a plain mutex that is never held across an await; a round with
/// an outstanding model call or run is marked in flight instead, and
/// further round operations are refused until it settles.
#[derive(Clone)]
pub struct QuizEngine {
    store: Arc<dyn TutorStore>,
    sessions: SessionService,
    llm: Arc<dyn TutorLlm>,
    runner: TestRunner,
    total_questions: u32,
    max_attempts: u32,
    states: QuizStates,
}

impl QuizEngine {
    pub fn new(
        store: Arc<dyn TutorStore>,
        sessions: SessionService,
        llm: Arc<dyn TutorLlm>,
        runner: TestRunner,
        total_questions: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            sessions,
            llm,
            runner,
            total_questions,
            max_attempts,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn with_state<R>(&self, session: &TutoringSession, f: impl FnOnce(&mut QuizState) -> R) -> R {
        let mut states = lock_states(&self.states);
        let now = Instant::now();
        if !states.contains_key(&session.id) {
            prune_idle(&mut states, now);
        }
        let state = states
            .entry(session.id.clone())
            .or_insert_with(|| QuizState::resume(session, self.total_questions));
        state.last_active = now;
        f(state)
    }

    fn round_guard(&self, session_id: &str) -> RoundGuard {
        RoundGuard {
            states: self.states.clone(),
            session_id: session_id.to_string(),
        }
    }

    /// Number of quizzes with in-memory round state.
    pub fn tracked_sessions(&self) -> usize {
        lock_states(&self.states).len()
    }

    /// The student in a running quiz. A finished quiz reads as `Finished`
    /// rather than a phase violation.
    async fn driver_session(
        &self,
        session_id: &str,
        actor_id: &str,
    ) -> Result<TutoringSession, QuizError> {
        match self
            .sessions
            .authorize(session_id, actor_id, SessionOperation::DriveQuiz)
            .await
        {
            Ok((session, _)) => Ok(session),
            Err(SessionError::Forbidden {
                role: Role::Student,
                phase: SessionStatus::Completed,
                ..
            }) => Err(QuizError::Finished),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches the next question, or returns the one still open.
    pub async fn load_question(
        &self,
        session_id: &str,
        actor_id: &str,
    ) -> Result<QuestionView, QuizError> {
        let session = self.driver_session(session_id, actor_id).await?;

        let plan = self.with_state(&session, |state| -> Result<LoadPlan, QuizError> {
            if state.progress.completed {
                return Ok(LoadPlan::Finish(state.progress.correct_count));
            }
            if let Some(view) = state.view() {
                return Ok(LoadPlan::Open(view));
            }
            state.ensure_idle()?;
            state.in_flight = true;
            Ok(LoadPlan::Fetch(QuestionInputs {
                difficulty: state.progress.difficulty,
                question_index: state.progress.question_index,
                total_questions: state.progress.total_questions,
                previous_questions: state.asked.clone(),
            }))
        })?;
        let inputs = match plan {
            LoadPlan::Open(view) => return Ok(view),
            LoadPlan::Fetch(inputs) => inputs,
            LoadPlan::Finish(correct_count) => {
                self.finish(session_id, correct_count).await?;
                return Err(QuizError::Finished);
            }
        };
        let _round = self.round_guard(session_id);

        let topic = self
            .store
            .get_beginner_topic(&session.topic_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::TopicNotFound(session.topic_id.clone()))?;
        let cumulative_topics = if topic.cumulative_topics.is_empty() {
            vec![topic.id.clone()]
        } else {
            topic.cumulative_topics.clone()
        };

        let request = QuestionRequest {
            topic_id: topic.id.clone(),
            topic_title: topic.title.clone(),
            cumulative_topics,
            difficulty: inputs.difficulty,
            question_index: inputs.question_index,
            total_questions: inputs.total_questions,
            previous_questions: inputs.previous_questions,
        };
        let question = self.llm.generate_question(&request).await?;

        tracing::info!(
            "Session {} question {}/{} loaded ({:?}, fn {})",
            session_id,
            request.question_index + 1,
            request.total_questions,
            request.difficulty,
            question.function_name
        );

        self.with_state(&session, |state| {
            state.asked.push(PreviousQuestion {
                prompt: question.question.clone(),
                function_name: question.function_name.clone(),
            });
            state.current = Some(ActiveQuestion {
                question,
                difficulty: request.difficulty,
                attempt_count: 0,
                last_run: None,
            });
            state.view()
        })
        .ok_or(QuizError::NoActiveQuestion)
    }

    /// Runs the student's code against the visible cases. Every run counts
    /// as an attempt.
    pub async fn run(
        &self,
        session_id: &str,
        actor_id: &str,
        code: &str,
    ) -> Result<RunReport, QuizError> {
        let session = self.driver_session(session_id, actor_id).await?;
        let max_attempts = self.max_attempts;

        let (function_name, test_cases) = self.with_state(&session, |state| -> Result<_, QuizError> {
            state.ensure_idle()?;
            let active = state.current.as_ref().ok_or(QuizError::NoActiveQuestion)?;
            if active.attempt_count >= max_attempts {
                return Err(QuizError::AttemptsExhausted(max_attempts));
            }
            let inputs = (
                active.question.function_name.clone(),
                active.question.test_cases.clone(),
            );
            state.in_flight = true;
            Ok(inputs)
        })?;
        let _round = self.round_guard(session_id);

        let run = self.runner.run(code, &function_name, &test_cases).await;

        self.with_state(&session, |state| -> Result<RunReport, QuizError> {
            let active = state.current.as_mut().ok_or(QuizError::NoActiveQuestion)?;
            active.attempt_count += 1;
            active.last_run = Some(run.clone());
            Ok(RunReport {
                run,
                attempt_count: active.attempt_count,
                max_attempts,
            })
        })
    }

    pub async fn submit(
        &self,
        session_id: &str,
        actor_id: &str,
        code: &str,
    ) -> Result<SubmitReport, QuizError> {
        let session = self.driver_session(session_id, actor_id).await?;
        let max_attempts = self.max_attempts;

        let (request, locally_passed) = self.with_state(&session, |state| -> Result<_, QuizError> {
            state.ensure_idle()?;
            let active = state.current.as_ref().ok_or(QuizError::NoActiveQuestion)?;
            let has_results = active
                .last_run
                .as_ref()
                .is_some_and(|run| !run.results.is_empty());
            // With attempts used up the round must still be closable.
            if !has_results && active.attempt_count < max_attempts {
                return Err(QuizError::RunFirst);
            }
            let request = EvaluationRequest {
                question: active.question.question.clone(),
                function_name: active.question.function_name.clone(),
                test_cases: active.question.test_cases.clone(),
                student_code: code.to_string(),
                attempt_number: active.attempt_count,
            };
            let locally_passed = active.last_run.as_ref().is_some_and(TestRun::all_passed);
            state.in_flight = true;
            Ok((request, locally_passed))
        })?;
        let _round = self.round_guard(session_id);

        let (passed, feedback) = match self.llm.evaluate_submission(&request).await {
            Ok(reply) => {
                let feedback = if reply.feedback.is_empty() {
                    "Could not evaluate. Check your code and try again.".to_string()
                } else {
                    reply.feedback
                };
                (reply.passed, feedback)
            }
            Err(LlmError::Malformed(reason)) => {
                tracing::warn!(
                    "Evaluation for session {} unreadable, grading locally: {}",
                    session_id,
                    reason
                );
                let feedback = if locally_passed {
                    "All tests passed!"
                } else {
                    "Some tests are failing. Check your code."
                };
                (locally_passed, feedback.to_string())
            }
            Err(e) => return Err(e.into()),
        };
        let attempt_count = request.attempt_number;

        let settled = self.with_state(&session, |state| -> Result<Settled, QuizError> {
            if !passed && attempt_count < max_attempts {
                return Ok(Settled::Retry {
                    correct_count: state.progress.correct_count,
                    difficulty: state.progress.difficulty,
                });
            }
            let active = state.current.take().ok_or(QuizError::NoActiveQuestion)?;
            let index = state.progress.question_index;
            let record = QuestionRecord {
                index,
                prompt: active.question.question,
                function_name: active.question.function_name,
                difficulty: active.difficulty,
                topics_tested: active.question.topics_tested,
                test_cases: active.question.test_cases,
                student_code: request.student_code.clone(),
                passed: Some(passed),
                feedback: feedback.clone(),
                attempt_count,
            };
            let advance = state.progress.record(passed).ok_or(QuizError::Finished)?;
            let patch = SessionPatch {
                append_question: Some(record),
                current_question_index: Some(state.progress.question_index),
                current_difficulty: Some(state.progress.difficulty),
                correct_count: Some(state.progress.correct_count),
                ..SessionPatch::default()
            };
            Ok(Settled::Closed {
                index,
                advance,
                patch,
                progress: state.progress.clone(),
            })
        })?;

        let (index, advance, patch, progress) = match settled {
            Settled::Retry {
                correct_count,
                difficulty,
            } => {
                QUIZ_ROUNDS_TOTAL
                    .with_label_values(&[outcome_label(RoundOutcome::Retry)])
                    .inc();
                return Ok(SubmitReport {
                    outcome: RoundOutcome::Retry,
                    passed,
                    feedback,
                    attempt_count,
                    correct_count,
                    difficulty,
                    next_question_index: None,
                    quiz_completed: false,
                    advance_after_ms: None,
                    xp_earned: None,
                });
            }
            Settled::Closed {
                index,
                advance,
                patch,
                progress,
            } => (index, advance, patch, progress),
        };

        let outcome = if passed {
            RoundOutcome::Passed
        } else {
            RoundOutcome::Exhausted
        };
        QUIZ_ROUNDS_TOTAL
            .with_label_values(&[outcome_label(outcome)])
            .inc();
        tracing::info!(
            "Session {} question {} {:?} after {} attempt(s), difficulty now {:?}",
            session_id,
            index + 1,
            outcome,
            attempt_count,
            progress.difficulty
        );

        if let Err(e) = self.sessions.record_quiz_round(session_id, patch).await {
            tracing::warn!("Failed to persist quiz round for {}: {}", session_id, e);
        }

        let (next_question_index, xp_earned) = match advance {
            RoundAdvance::Next(index) => (Some(index), None),
            RoundAdvance::Complete { correct_count } => {
                match self.finish(session_id, correct_count).await {
                    Ok(xp) => (None, xp),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to complete session {}, next load retries: {}",
                            session_id,
                            e
                        );
                        (None, None)
                    }
                }
            }
        };

        Ok(SubmitReport {
            outcome,
            passed,
            feedback,
            attempt_count,
            correct_count: progress.correct_count,
            difficulty: progress.difficulty,
            next_question_index,
            quiz_completed: progress.completed,
            advance_after_ms: Some(if passed {
                ADVANCE_AFTER_PASS_MS
            } else {
                ADVANCE_AFTER_EXHAUSTED_MS
            }),
            xp_earned,
        })
    }

    /// Completes the session and drops its round state. Safe to repeat.
    async fn finish(
        &self,
        session_id: &str,
        correct_count: u32,
    ) -> Result<Option<u32>, QuizError> {
        let xp = self.sessions.complete_quiz(session_id, correct_count).await?;
        lock_states(&self.states).remove(session_id);
        Ok(xp)
    }

    /// Read-only view for either participant. Never waits on an
    /// outstanding round.
    pub async fn snapshot(
        &self,
        session_id: &str,
        actor_id: &str,
    ) -> Result<QuizSnapshot, QuizError> {
        let (session, _) = self
            .sessions
            .authorize(session_id, actor_id, SessionOperation::Observe)
            .await?;
        let states = lock_states(&self.states);
        Ok(match states.get(&session.id) {
            Some(state) => state.snapshot(&session),
            None => QuizState::resume(&session, self.total_questions).snapshot(&session),
        })
    }
}

fn outcome_label(outcome: RoundOutcome) -> &'static str {
    match outcome {
        RoundOutcome::Passed => "passed",
        RoundOutcome::Exhausted => "exhausted",
        RoundOutcome::Retry => "retry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_passes_step_difficulty_up() {
        let mut progress = QuizProgress::new(10);
        progress.record(true);
        assert_eq!(progress.difficulty, Difficulty::Easy);
        progress.record(true);
        assert_eq!(progress.difficulty, Difficulty::Medium);
        assert_eq!(progress.consecutive_correct, 0);
    }

    #[test]
    fn alternating_outcomes_never_move_difficulty() {
        let mut progress = QuizProgress::new(10);
        progress.difficulty = Difficulty::Medium;
        for passed in [true, false, true, false, true] {
            progress.record(passed);
            assert_eq!(progress.difficulty, Difficulty::Medium);
        }
    }

    #[test]
    fn ladder_floors_at_easy() {
        let mut progress = QuizProgress::new(10);
        for _ in 0..4 {
            progress.record(false);
        }
        assert_eq!(progress.difficulty, Difficulty::Easy);
        assert_eq!(progress.correct_count, 0);
    }

    #[test]
    fn completion_is_reported_once() {
        let mut progress = QuizProgress::new(3);
        assert_eq!(progress.record(true), Some(RoundAdvance::Next(1)));
        assert_eq!(progress.record(false), Some(RoundAdvance::Next(2)));
        assert_eq!(
            progress.record(true),
            Some(RoundAdvance::Complete { correct_count: 2 })
        );
        assert_eq!(progress.record(true), None);

        let trues = progress
            .question_results
            .iter()
            .filter(|r| **r == Some(true))
            .count() as u32;
        assert_eq!(trues, progress.correct_count);
        assert!(progress.question_results.iter().all(Option::is_some));
    }
}
