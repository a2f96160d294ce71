use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::AssessmentError;
use crate::metrics::LEVELS_COMPLETED_TOTAL;
use crate::models::assessment::{
    AssessmentContext, AttemptView, ChatContext, ChatMessage, ChatRole, ScoreBreakdown,
    SubmitOutcome, SubmittedSolution, VerdictSource,
};
use crate::models::content::{level_label, LevelType};
use crate::models::{Problem, TestRun, Topic};
use crate::services::llm::json::parse_verdict;
use crate::services::llm::{collect_text, TextStream, TutorLlm};
use crate::services::scoring::calculate_score;
use crate::services::store::TutorStore;
use crate::services::test_runner::TestRunner;

pub const RUN_FIRST_MESSAGE: &str =
    "Run your code first before submitting! Click the **Run** button to see your test results.";
const DEFAULT_REQUIRED_SOLUTIONS: u32 = 3;
/// Finished attempts stay readable this long before they are dropped.
const COMPLETED_RETENTION: Duration = Duration::from_secs(10 * 60);
/// Attempts nobody has touched for this long are dropped.
const IDLE_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

struct Attempt {
    id: String,
    user_id: String,
    topic: Topic,
    problem: Problem,
    level: u8,
    code: String,
    attempt_count: u32,
    last_run: Option<TestRun>,
    messages: Vec<ChatMessage>,
    submitted_solutions: Vec<SubmittedSolution>,
    started_at: Instant,
    last_active: Instant,
    completed_at: Option<Instant>,
    score: Option<ScoreBreakdown>,
    /// Set while a code run or an assessor call is outstanding.
    in_flight: bool,
}

impl Attempt {
    fn push_message(&mut self, role: ChatRole, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    fn completed(&self) -> bool {
        self.score.is_some()
    }

    fn ensure_idle(&self, attempt_id: &str) -> Result<(), AssessmentError> {
        if self.completed() {
            return Err(AssessmentError::AlreadyCompleted(attempt_id.to_string()));
        }
        if self.in_flight {
            return Err(AssessmentError::InFlight(attempt_id.to_string()));
        }
        Ok(())
    }

    fn expired(&self, now: Instant) -> bool {
        match self.completed_at {
            Some(at) => now.duration_since(at) >= COMPLETED_RETENTION,
            None => !self.in_flight && now.duration_since(self.last_active) >= IDLE_RETENTION,
        }
    }

    fn context(&self) -> AssessmentContext {
        let problem = &self.problem;
        AssessmentContext {
            topic: self.topic.title.clone(),
            level: self.level,
            level_type: problem.level_type,
            problem_title: problem.title.clone(),
            problem_description: problem.description.clone(),
            test_cases: problem
                .test_cases
                .iter()
                .filter(|tc| !tc.is_hidden)
                .cloned()
                .collect(),
            student_code: self.code.clone(),
            attempt_number: self.attempt_count,
            test_results: self
                .last_run
                .as_ref()
                .map(|run| run.results.clone())
                .unwrap_or_default(),
            constraints: problem.constraints.clone(),
            required_solutions: match problem.level_type {
                LevelType::MultiPath => Some(
                    problem
                        .required_solutions
                        .unwrap_or(DEFAULT_REQUIRED_SOLUTIONS),
                ),
                _ => problem.required_solutions,
            },
            submitted_solutions: self.submitted_solutions.clone(),
            chat_history: self.messages.clone(),
        }
    }

    fn view(&self) -> AttemptView {
        let problem = &self.problem;
        AttemptView {
            attempt_id: self.id.clone(),
            user_id: self.user_id.clone(),
            topic_id: self.topic.id.clone(),
            level: self.level,
            level_type: problem.level_type,
            problem_title: problem.title.clone(),
            problem_description: problem.description.clone(),
            constraints: problem.constraints.clone(),
            required_solutions: problem.required_solutions,
            visible_test_cases: problem
                .test_cases
                .iter()
                .filter(|tc| !tc.is_hidden)
                .cloned()
                .collect(),
            code: self.code.clone(),
            attempt_count: self.attempt_count,
            last_run: self.last_run.clone(),
            messages: self.messages.clone(),
            completed: self.completed(),
            score: self.score,
        }
    }

    fn remember_approach(&mut self, label: &str) {
        let label = label.trim();
        if label.is_empty()
            || self
                .submitted_solutions
                .iter()
                .any(|s| s.approach.eq_ignore_ascii_case(label))
        {
            return;
        }
        self.submitted_solutions.push(SubmittedSolution {
            solution_number: self.submitted_solutions.len() as u32 + 1,
            code: self.code.clone(),
            approach: label.to_string(),
        });
    }
}

fn intro_message(problem: &Problem) -> String {
    let description = &problem.description;
    match problem.level_type {
        LevelType::Syntax => format!(
            "Let's work on syntax basics!\n\n{}\n\nDefine `{}` in the editor and press Run to test it.",
            description, problem.function_name
        ),
        LevelType::MultiPath => format!(
            "Time for multi-path thinking!\n\n{}\n\nFind {} genuinely different approaches. Start with the one that feels natural.",
            description,
            problem.required_solutions.unwrap_or(DEFAULT_REQUIRED_SOLUTIONS)
        ),
        LevelType::ErrorNavigation => format!(
            "Bug hunt time!\n\nThe editor holds broken code. {}\n\nFind the bugs, fix them and run the tests to check.",
            description
        ),
        LevelType::Constraint => format!(
            "Constraint challenge!\n\n{}\n\nForbidden: {}. What other JavaScript features could do the job?",
            description,
            problem.constraints.join(", ")
        ),
        LevelType::MicroProject => format!(
            "Time to build something real!\n\n{}\n\nGet one feature working at a time, then move on to the next.",
            description
        ),
    }
}

type Attempts = Arc<Mutex<HashMap<String, Attempt>>>;

fn lock_attempts(attempts: &Attempts) -> MutexGuard<'_, HashMap<String, Attempt>> {
    attempts
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears an attempt's in-flight mark when dropped, so a request abandoned
/// mid-await does not wedge the attempt.
struct InFlightGuard {
    attempts: Attempts,
    attempt_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(attempt) = lock_attempts(&self.attempts).get_mut(&self.attempt_id) {
            attempt.in_flight = false;
        }
    }
}

enum SubmitPlan {
    RunFirst,
    Assess(Box<AssessmentContext>),
}

/// Chat-assisted attempts at a single level problem, scored on a pass.
/// Unlike the beginner quiz there is no attempt cap.
#[derive(Clone)]
pub struct AssessmentService {
    store: Arc<dyn TutorStore>,
    llm: Arc<dyn TutorLlm>,
    runner: TestRunner,
    attempts: Attempts,
}

impl AssessmentService {
    pub fn new(store: Arc<dyn TutorStore>, llm: Arc<dyn TutorLlm>, runner: TestRunner) -> Self {
        Self {
            store,
            llm,
            runner,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `f` against the attempt under the map lock. Never held across an
    /// await.
    fn with_attempt<T>(
        &self,
        attempt_id: &str,
        f: impl FnOnce(&mut Attempt) -> Result<T, AssessmentError>,
    ) -> Result<T, AssessmentError> {
        let mut attempts = lock_attempts(&self.attempts);
        let attempt = attempts
            .get_mut(attempt_id)
            .ok_or_else(|| AssessmentError::AttemptNotFound(attempt_id.to_string()))?;
        attempt.last_active = Instant::now();
        f(attempt)
    }

    /// Marks the attempt busy; the returned guard clears the mark.
    fn begin(&self, attempt: &mut Attempt) -> InFlightGuard {
        attempt.in_flight = true;
        InFlightGuard {
            attempts: self.attempts.clone(),
            attempt_id: attempt.id.clone(),
        }
    }

    fn prune(&self) {
        let now = Instant::now();
        let mut attempts = lock_attempts(&self.attempts);
        let before = attempts.len();
        attempts.retain(|_, attempt| !attempt.expired(now));
        let dropped = before - attempts.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} finished or idle attempts", dropped);
        }
    }

    /// Loads the first problem of the level and starts the clock.
    pub async fn start(
        &self,
        topic_id: &str,
        level: u8,
        user_id: &str,
    ) -> Result<AttemptView, AssessmentError> {
        let label = level_label(level).ok_or(AssessmentError::InvalidLevel(level))?;
        let topic = self
            .store
            .get_topic(topic_id)
            .await
            .map_err(AssessmentError::Store)?
            .ok_or_else(|| AssessmentError::TopicNotFound(topic_id.to_string()))?;
        let problem = self
            .store
            .get_problems_for_level(topic_id, level)
            .await
            .map_err(AssessmentError::Store)?
            .into_iter()
            .next()
            .ok_or_else(|| AssessmentError::ProblemNotFound {
                topic_id: topic_id.to_string(),
                level,
            })?;

        let now = Instant::now();
        let mut attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            code: problem.starter_code(),
            topic,
            level,
            attempt_count: 0,
            last_run: None,
            messages: Vec::new(),
            submitted_solutions: Vec::new(),
            started_at: now,
            last_active: now,
            completed_at: None,
            score: None,
            in_flight: false,
            problem,
        };
        attempt.push_message(
            ChatRole::System,
            format!("Level {}: {} - {}", level, label.name, attempt.topic.title),
        );
        attempt.push_message(ChatRole::Assistant, intro_message(&attempt.problem));

        tracing::info!(
            "Attempt {} started: user={} topic={} level={} problem={}",
            attempt.id,
            user_id,
            topic_id,
            level,
            attempt.problem.id
        );

        self.prune();
        let view = attempt.view();
        lock_attempts(&self.attempts).insert(attempt.id.clone(), attempt);
        Ok(view)
    }

    pub async fn get(&self, attempt_id: &str) -> Result<AttemptView, AssessmentError> {
        self.with_attempt(attempt_id, |attempt| Ok(attempt.view()))
    }

    /// Runs the code against the visible cases. Only runs where the function
    /// loaded count as an attempt.
    pub async fn run(&self, attempt_id: &str, code: &str) -> Result<AttemptView, AssessmentError> {
        let (function_name, test_cases, _guard) = self.with_attempt(attempt_id, |attempt| {
            attempt.ensure_idle(attempt_id)?;
            let guard = self.begin(attempt);
            Ok((
                attempt.problem.function_name.clone(),
                attempt.problem.test_cases.clone(),
                guard,
            ))
        })?;

        let run = self.runner.run(code, &function_name, &test_cases).await;

        self.with_attempt(attempt_id, |attempt| {
            attempt.code = code.to_string();
            if run.error.is_none() {
                attempt.attempt_count += 1;
            }
            attempt.last_run = Some(run);
            Ok(attempt.view())
        })
    }

    /// Sends the attempt to the assessor and scores it on a pass. Without a
    /// readable verdict the local test results decide.
    pub async fn submit(
        &self,
        attempt_id: &str,
        code: &str,
    ) -> Result<SubmitOutcome, AssessmentError> {
        let (plan, guard) = self.with_attempt(attempt_id, |attempt| {
            attempt.ensure_idle(attempt_id)?;
            let has_results = attempt
                .last_run
                .as_ref()
                .is_some_and(|run| !run.results.is_empty());
            if !has_results {
                attempt.push_message(ChatRole::Assistant, RUN_FIRST_MESSAGE);
                return Ok((SubmitPlan::RunFirst, None));
            }
            let mut context = attempt.context();
            context.student_code = code.to_string();
            let guard = self.begin(attempt);
            Ok((SubmitPlan::Assess(Box::new(context)), Some(guard)))
        })?;

        let context = match plan {
            SubmitPlan::RunFirst => {
                return Ok(SubmitOutcome::RunFirst {
                    message: RUN_FIRST_MESSAGE.to_string(),
                })
            }
            SubmitPlan::Assess(context) => context,
        };

        let reply = self.llm.assess_level_submission(&context).await?;
        let reply = collect_text(reply).await?;

        let graded = self.with_attempt(attempt_id, |attempt| {
            attempt.code = code.to_string();
            let level_type = attempt.problem.level_type;
            let (passed, creativity, feedback, source) = match parse_verdict(&reply) {
                Some(verdict) => {
                    if level_type == LevelType::MultiPath {
                        if let Some(label) = verdict.approach_label.as_deref() {
                            attempt.remember_approach(label);
                        }
                    }
                    let creativity = if level_type.awards_creativity() {
                        verdict.creativity_points()
                    } else {
                        0
                    };
                    let feedback = if verdict.feedback.trim().is_empty() {
                        reply.clone()
                    } else {
                        verdict.feedback
                    };
                    (verdict.passed, creativity, feedback, VerdictSource::Assessor)
                }
                None => {
                    tracing::warn!(
                        "Assessor reply for attempt {} had no verdict, using local results",
                        attempt_id
                    );
                    let passed = attempt.last_run.as_ref().is_some_and(TestRun::all_passed);
                    (passed, 0, reply.clone(), VerdictSource::LocalTests)
                }
            };
            attempt.push_message(ChatRole::Assistant, feedback.clone());

            if !passed {
                tracing::info!(
                    "Attempt {} not passed yet (run {})",
                    attempt_id,
                    attempt.attempt_count
                );
                return Ok(Err(SubmitOutcome::NotYet {
                    feedback,
                    verdict_source: source,
                }));
            }

            let elapsed_seconds = attempt.started_at.elapsed().as_secs();
            let score = calculate_score(
                attempt.level,
                attempt.attempt_count,
                elapsed_seconds,
                creativity,
            );
            attempt.score = Some(score);
            attempt.completed_at = Some(Instant::now());
            Ok(Ok((
                attempt.user_id.clone(),
                attempt.topic.id.clone(),
                attempt.level,
                score,
                elapsed_seconds,
                feedback,
                source,
            )))
        })?;
        drop(guard);

        let (user_id, topic_id, level, score, elapsed_seconds, feedback, source) = match graded {
            Ok(passed) => passed,
            Err(not_yet) => return Ok(not_yet),
        };

        if let Err(e) = self
            .store
            .complete_level(&user_id, &topic_id, level, score.final_score)
            .await
        {
            tracing::warn!("Failed to save progress for attempt {}: {}", attempt_id, e);
        }
        LEVELS_COMPLETED_TOTAL
            .with_label_values(&[&level.to_string()])
            .inc();
        tracing::info!(
            "Attempt {} passed level {} with {} points in {}s",
            attempt_id,
            level,
            score.final_score,
            elapsed_seconds
        );

        Ok(SubmitOutcome::Passed {
            feedback,
            verdict_source: source,
            score,
            elapsed_seconds,
        })
    }

    /// Streams the tutor's reply. The exchange is added to the attempt's
    /// chat once the reply has finished.
    pub async fn chat(
        &self,
        attempt_id: &str,
        message: &str,
        code: Option<String>,
    ) -> Result<TextStream, AssessmentError> {
        let context = self.with_attempt(attempt_id, |attempt| {
            if let Some(code) = code {
                attempt.code = code;
            }
            let context = ChatContext {
                assessment: attempt.context(),
                user_message: message.to_string(),
            };
            attempt.push_message(ChatRole::User, message);
            Ok(context)
        })?;

        let reply = self.llm.chat_reply(&context).await?;
        Ok(record_reply(reply, self.attempts.clone(), attempt_id.to_string()))
    }
}

fn record_reply(reply: TextStream, attempts: Attempts, attempt_id: String) -> TextStream {
    stream::unfold(
        (reply, String::new(), Some((attempts, attempt_id))),
        |(mut reply, mut text, target)| async move {
            let target = target?;
            match reply.next().await {
                Some(Ok(chunk)) => {
                    text.push_str(&chunk);
                    Some((Ok(chunk), (reply, text, Some(target))))
                }
                Some(Err(e)) => Some((Err(e), (reply, text, None))),
                None => {
                    let (attempts, attempt_id) = target;
                    if !text.is_empty() {
                        if let Some(attempt) = lock_attempts(&attempts).get_mut(&attempt_id) {
                            attempt.push_message(ChatRole::Assistant, text);
                        }
                    }
                    None
                }
            }
        },
    )
    .boxed()
}
