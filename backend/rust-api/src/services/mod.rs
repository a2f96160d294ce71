use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, StoreBackend};
use crate::services::assessment_service::AssessmentService;
use crate::services::call_service::CallService;
use crate::services::executor::{CodeExecutor, NodeExecutor};
use crate::services::llm::{GeminiTutor, TutorLlm};
use crate::services::quiz_engine::QuizEngine;
use crate::services::session_service::SessionService;
use crate::services::store::{MemoryStore, MongoStore, TutorStore};
use crate::services::test_runner::TestRunner;
use crate::services::transport_service::TransportTokens;

pub mod assessment_service;
pub mod call_service;
pub mod executor;
pub mod llm;
pub mod quiz_engine;
pub mod scoring;
pub mod session_service;
pub mod store;
pub mod test_runner;
pub mod transport_service;

/// Shared handles for every request. Collaborators are injected so tests
/// can swap in fakes.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn TutorStore>,
    pub calls: CallService,
    pub sessions: SessionService,
    pub quizzes: QuizEngine,
    pub assessments: AssessmentService,
    pub transport: TransportTokens,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn TutorStore> = match config.store_backend {
            StoreBackend::Mongo => Arc::new(MongoStore::connect(&config).await?),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };
        let llm: Arc<dyn TutorLlm> = Arc::new(GeminiTutor::new(&config));
        if config.gemini_api_key.is_none() {
            tracing::warn!("GEMINI_API_KEY is not set; quiz and tutor requests will fail");
        }
        let executor: Arc<dyn CodeExecutor> = Arc::new(NodeExecutor::new(
            config.node_binary.clone(),
            Duration::from_millis(config.runner_timeout_ms),
        ));
        Ok(Self::with_collaborators(config, store, llm, executor))
    }

    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn TutorStore>,
        llm: Arc<dyn TutorLlm>,
        executor: Arc<dyn CodeExecutor>,
    ) -> Self {
        let runner = TestRunner::new(executor);
        let sessions = SessionService::new(store.clone());
        let calls = CallService::new(
            store.clone(),
            sessions.clone(),
            Duration::from_secs(config.ring_timeout_seconds),
        );
        let quizzes = QuizEngine::new(
            store.clone(),
            sessions.clone(),
            llm.clone(),
            runner.clone(),
            config.quiz_total_questions,
            config.quiz_max_attempts,
        );
        let assessments = AssessmentService::new(store.clone(), llm, runner);
        let transport = TransportTokens::new(&config);

        Self {
            config,
            store,
            calls,
            sessions,
            quizzes,
            assessments,
            transport,
        }
    }
}
