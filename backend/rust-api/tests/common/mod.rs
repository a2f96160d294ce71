#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use codetutor_api::{
    config::Config,
    create_router,
    errors::LlmError,
    models::{
        assessment::{AssessmentContext, ChatContext},
        call::StartCallRequest,
        BeginnerTopic, Call, CallPatch, Difficulty, EvaluationReply, EvaluationRequest,
        GeneratedQuestion, LevelType, NewCall, NewSession, Problem, QuestionRequest,
        SeedContent, SessionPatch, TestCase, Topic, TutorAvailability, TutoringSession,
        UserProgress,
    },
    services::{
        executor::{CallOutcome, CodeExecutor, Execution},
        llm::{TextStream, TutorLlm},
        store::{Feed, MemoryStore, SeedSummary, TutorStore, Update},
        AppState,
    },
};

pub const STUDENT: &str = "student-1";
pub const TUTOR: &str = "tutor-1";
pub const BEGINNER_TOPIC: &str = "variables";
pub const TOPIC: &str = "functions";

pub const PASSING_CODE: &str = "function add(a, b) { return a + b; }";
pub const FAILING_CODE: &str = "function add(a, b) { return 0; }";

/// Language model whose replies are queued by the test. Unscripted
/// questions are generated from the request; unscripted evaluations come
/// back malformed so the local test results decide.
#[derive(Default)]
pub struct FakeLlm {
    questions: Mutex<VecDeque<Result<GeneratedQuestion, LlmError>>>,
    evaluations: Mutex<VecDeque<Result<EvaluationReply, LlmError>>>,
    assessments: Mutex<VecDeque<Result<String, LlmError>>>,
    chat_chunks: Mutex<Vec<Result<String, LlmError>>>,
    pub question_requests: Mutex<Vec<QuestionRequest>>,
    pub assessment_contexts: Mutex<Vec<AssessmentContext>>,
    stall_questions: AtomicBool,
}

impl FakeLlm {
    pub fn push_question(&self, question: Result<GeneratedQuestion, LlmError>) {
        self.questions.lock().unwrap().push_back(question);
    }

    pub fn push_evaluation(&self, evaluation: Result<EvaluationReply, LlmError>) {
        self.evaluations.lock().unwrap().push_back(evaluation);
    }

    pub fn push_assessment(&self, reply: Result<String, LlmError>) {
        self.assessments.lock().unwrap().push_back(reply);
    }

    pub fn set_chat(&self, chunks: Vec<Result<String, LlmError>>) {
        *self.chat_chunks.lock().unwrap() = chunks;
    }

    /// While set, question generation never answers.
    pub fn stall_questions(&self, stall: bool) {
        self.stall_questions.store(stall, Ordering::SeqCst);
    }

    pub fn requested_difficulties(&self) -> Vec<Difficulty> {
        self.question_requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.difficulty)
            .collect()
    }
}

#[async_trait]
impl TutorLlm for FakeLlm {
    async fn generate_question(
        &self,
        request: &QuestionRequest,
    ) -> Result<GeneratedQuestion, LlmError> {
        self.question_requests.lock().unwrap().push(request.clone());
        if self.stall_questions.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.questions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(add_question(request.difficulty)))
    }

    async fn evaluate_submission(
        &self,
        _request: &EvaluationRequest,
    ) -> Result<EvaluationReply, LlmError> {
        self.evaluations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Malformed("no evaluation scripted".into())))
    }

    async fn assess_level_submission(
        &self,
        context: &AssessmentContext,
    ) -> Result<TextStream, LlmError> {
        self.assessment_contexts.lock().unwrap().push(context.clone());
        let reply = self
            .assessments
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Looks like you are getting there.".to_string()))?;
        // Split so the service has to stitch chunks back together.
        let (head, tail) = reply.split_at(reply.len() / 2);
        let chunks = vec![Ok(head.to_string()), Ok(tail.to_string())];
        Ok(stream::iter(chunks).boxed())
    }

    async fn chat_reply(&self, _context: &ChatContext) -> Result<TextStream, LlmError> {
        let chunks = self.chat_chunks.lock().unwrap().clone();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Executes `add`-style functions: code containing `a + b` sums its
/// arguments, anything else returns null.
pub struct SumExecutor;

#[async_trait]
impl CodeExecutor for SumExecutor {
    async fn execute(
        &self,
        code: &str,
        function_name: &str,
        calls: &[Vec<Value>],
    ) -> anyhow::Result<Execution> {
        if code.contains("syntax error") {
            return Ok(Execution::LoadFailed {
                message: "SyntaxError: Unexpected token".to_string(),
            });
        }
        if !code.contains(&format!("function {}", function_name)) {
            return Ok(Execution::FunctionMissing);
        }
        let sums = code.contains("a + b");
        let outcomes = calls
            .iter()
            .map(|args| {
                if sums {
                    let total: i64 = args.iter().filter_map(Value::as_i64).sum();
                    CallOutcome::Returned { value: json!(total) }
                } else {
                    CallOutcome::Returned { value: Value::Null }
                }
            })
            .collect();
        Ok(Execution::Completed { outcomes })
    }
}

pub fn add_question(difficulty: Difficulty) -> GeneratedQuestion {
    GeneratedQuestion {
        question: "Write a function add(a, b) that returns the sum.".to_string(),
        function_name: "add".to_string(),
        test_cases: vec![
            case("1", json!([1, 2]), json!(3), false),
            case("2", json!([-4, 4]), json!(0), false),
            case("3", json!([10, 15]), json!(25), true),
        ],
        hint: "Use the + operator.".to_string(),
        difficulty,
        topics_tested: vec![BEGINNER_TOPIC.to_string()],
    }
}

pub fn case(id: &str, input: Value, expected: Value, hidden: bool) -> TestCase {
    TestCase {
        id: id.to_string(),
        description: format!("case {}", id),
        input,
        expected_output: expected,
        is_hidden: hidden,
    }
}

pub fn problem(id: &str, level: u8, level_type: LevelType) -> Problem {
    Problem {
        id: id.to_string(),
        topic_id: TOPIC.to_string(),
        level,
        level_type,
        title: format!("Add numbers ({})", level_type.as_str()),
        description: "Write add(a, b) that returns a + b.".to_string(),
        function_name: "add".to_string(),
        starter_code: None,
        constraints: Vec::new(),
        project_requirements: Vec::new(),
        test_cases: vec![
            case("1", json!([1, 2]), json!(3), false),
            case("2", json!([5, 5]), json!(10), false),
            case("3", json!([7, 1]), json!(8), true),
        ],
        required_solutions: None,
        difficulty: Difficulty::Easy,
        order: 0,
    }
}

pub fn seed() -> SeedContent {
    SeedContent {
        topics: vec![Topic {
            id: TOPIC.to_string(),
            title: "Functions".to_string(),
            description: "Declaring and calling functions.".to_string(),
            category: "fundamentals".to_string(),
            order: 1,
            prerequisites: Vec::new(),
            is_active: true,
        }],
        problems: vec![
            problem("functions-1", 1, LevelType::Syntax),
            problem("functions-2", 2, LevelType::MultiPath),
            problem("functions-4", 4, LevelType::Constraint),
        ],
        beginner_topics: vec![BeginnerTopic {
            id: BEGINNER_TOPIC.to_string(),
            title: "Variables".to_string(),
            description: "Storing values.".to_string(),
            order: 1,
            prerequisites: Vec::new(),
            cumulative_topics: Vec::new(),
            is_active: true,
        }],
    }
}

pub fn test_config() -> Config {
    Config {
        transport_api_key: Some("devkey".to_string()),
        transport_api_secret: Some("devsecret-devsecret-devsecret".to_string()),
        ..Config::default()
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub llm: Arc<FakeLlm>,
    pub router: Router,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: Config) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(MemoryStore::new());
    store
        .seed_content(seed())
        .await
        .expect("Failed to seed test content");

    let llm = Arc::new(FakeLlm::default());
    let state = Arc::new(AppState::with_collaborators(
        config,
        store.clone(),
        llm.clone(),
        Arc::new(SumExecutor),
    ));
    let router = create_router(state.clone());

    TestApp {
        state,
        store,
        llm,
        router,
    }
}

impl TestApp {
    /// Places a call from the student to the tutor; returns (call id, session id).
    pub async fn place_call(&self) -> (String, String) {
        let placed = self
            .state
            .calls
            .place_call(StartCallRequest {
                student_id: STUDENT.to_string(),
                student_name: Some("Sam".to_string()),
                tutor_id: TUTOR.to_string(),
                topic_id: BEGINNER_TOPIC.to_string(),
            })
            .await
            .expect("Failed to place call");
        (placed.call.id, placed.session_id)
    }

    /// Session that has been accepted and moved to the quiz phase.
    pub async fn session_in_quiz(&self) -> String {
        let (call_id, session_id) = self.place_call().await;
        self.state
            .calls
            .accept(&call_id, TUTOR)
            .await
            .expect("Failed to accept call");
        self.state
            .sessions
            .start_quiz(&session_id, TUTOR)
            .await
            .expect("Failed to start quiz");
        session_id
    }

    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request("GET", uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, Some(body)).await
    }
}

/// Memory store whose topic-completion writes fail while `topic_failures`
/// is above zero.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub topic_failures: AtomicU32,
}

impl FlakyStore {
    pub fn failing_topic_writes(times: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            topic_failures: AtomicU32::new(times),
        }
    }
}

#[async_trait]
impl TutorStore for FlakyStore {
    async fn create_call(&self, call: NewCall) -> anyhow::Result<Call> {
        self.inner.create_call(call).await
    }
    async fn get_call(&self, call_id: &str) -> anyhow::Result<Option<Call>> {
        self.inner.get_call(call_id).await
    }
    async fn update_call(&self, call_id: &str, patch: CallPatch) -> anyhow::Result<Update<Call>> {
        self.inner.update_call(call_id, patch).await
    }
    async fn ringing_calls_for(&self, target_id: &str) -> anyhow::Result<Vec<Call>> {
        self.inner.ringing_calls_for(target_id).await
    }
    async fn watch_call(&self, call_id: &str) -> anyhow::Result<Feed<Call>> {
        self.inner.watch_call(call_id).await
    }
    async fn watch_incoming_calls(&self, target_id: &str) -> anyhow::Result<Feed<Vec<Call>>> {
        self.inner.watch_incoming_calls(target_id).await
    }
    async fn create_session(&self, session: NewSession) -> anyhow::Result<TutoringSession> {
        self.inner.create_session(session).await
    }
    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<TutoringSession>> {
        self.inner.get_session(session_id).await
    }
    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> anyhow::Result<Update<TutoringSession>> {
        self.inner.update_session(session_id, patch).await
    }
    async fn watch_session(&self, session_id: &str) -> anyhow::Result<Feed<TutoringSession>> {
        self.inner.watch_session(session_id).await
    }
    async fn get_user_progress(&self, user_id: &str) -> anyhow::Result<UserProgress> {
        self.inner.get_user_progress(user_id).await
    }
    async fn complete_level(
        &self,
        user_id: &str,
        topic_id: &str,
        level: u8,
        score: u32,
    ) -> anyhow::Result<UserProgress> {
        self.inner.complete_level(user_id, topic_id, level, score).await
    }
    async fn complete_topic(
        &self,
        user_id: &str,
        topic_id: &str,
        session_id: &str,
        correct_count: u32,
    ) -> anyhow::Result<u32> {
        let failing = self
            .topic_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection reset while writing progress");
        }
        self.inner
            .complete_topic(user_id, topic_id, session_id, correct_count)
            .await
    }
    async fn get_topics(&self) -> anyhow::Result<Vec<Topic>> {
        self.inner.get_topics().await
    }
    async fn get_topic(&self, topic_id: &str) -> anyhow::Result<Option<Topic>> {
        self.inner.get_topic(topic_id).await
    }
    async fn get_problems_for_level(&self, topic_id: &str, level: u8) -> anyhow::Result<Vec<Problem>> {
        self.inner.get_problems_for_level(topic_id, level).await
    }
    async fn get_beginner_topic(&self, topic_id: &str) -> anyhow::Result<Option<BeginnerTopic>> {
        self.inner.get_beginner_topic(topic_id).await
    }
    async fn seed_content(&self, content: SeedContent) -> anyhow::Result<SeedSummary> {
        self.inner.seed_content(content).await
    }
    async fn set_tutor_presence(&self, availability: TutorAvailability) -> anyhow::Result<()> {
        self.inner.set_tutor_presence(availability).await
    }
    async fn online_tutors(&self) -> anyhow::Result<Vec<TutorAvailability>> {
        self.inner.online_tutors().await
    }
    async fn ping(&self) -> anyhow::Result<()> {
        self.inner.ping().await
    }
}
