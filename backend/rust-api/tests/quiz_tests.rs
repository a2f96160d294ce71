use std::sync::Arc;
use std::time::Duration;

use codetutor_api::{
    config::Config,
    errors::{LlmError, QuizError, SessionError},
    models::{
        call::StartCallRequest, quiz::RoundOutcome, quiz::SubmitReport, Difficulty,
        EvaluationReply, SessionStatus,
    },
    services::{
        quiz_engine::{ADVANCE_AFTER_EXHAUSTED_MS, ADVANCE_AFTER_PASS_MS, QUIZ_IDLE_RETENTION},
        store::TutorStore,
        AppState,
    },
};

mod common;

use common::{
    FakeLlm, FlakyStore, SumExecutor, TestApp, BEGINNER_TOPIC, FAILING_CODE, PASSING_CODE,
    STUDENT, TUTOR,
};

async fn pass_round(app: &TestApp, session_id: &str) -> SubmitReport {
    let quiz = &app.state.quizzes;
    quiz.load_question(session_id, STUDENT).await.unwrap();
    quiz.run(session_id, STUDENT, PASSING_CODE).await.unwrap();
    quiz.submit(session_id, STUDENT, PASSING_CODE).await.unwrap()
}

async fn exhaust_round(app: &TestApp, session_id: &str) -> SubmitReport {
    let quiz = &app.state.quizzes;
    quiz.load_question(session_id, STUDENT).await.unwrap();
    for _ in 0..3 {
        quiz.run(session_id, STUDENT, FAILING_CODE).await.unwrap();
    }
    quiz.submit(session_id, STUDENT, FAILING_CODE).await.unwrap()
}

#[tokio::test]
async fn perfect_quiz_finishes_after_ten_rounds() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;

    for round in 0..9 {
        let report = pass_round(&app, &session_id).await;
        assert_eq!(report.outcome, RoundOutcome::Passed);
        assert_eq!(report.next_question_index, Some(round + 1));
        assert_eq!(report.advance_after_ms, Some(ADVANCE_AFTER_PASS_MS));
        assert!(!report.quiz_completed);
    }

    let last = pass_round(&app, &session_id).await;
    assert!(last.quiz_completed);
    assert_eq!(last.correct_count, 10);
    assert_eq!(last.next_question_index, None);
    assert_eq!(last.xp_earned, Some(100));

    assert_eq!(
        app.llm.requested_difficulties(),
        vec![
            Difficulty::Easy,
            Difficulty::Easy,
            Difficulty::Medium,
            Difficulty::Medium,
            Difficulty::Hard,
            Difficulty::Hard,
            Difficulty::Hard,
            Difficulty::Hard,
            Difficulty::Hard,
            Difficulty::Hard,
        ]
    );

    let session = app.state.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.questions.len(), 10);
    assert_eq!(session.correct_count, 10);
    assert_eq!(session.total_score, 10);

    let err = app
        .state
        .quizzes
        .load_question(&session_id, STUDENT)
        .await
        .unwrap_err();
    assert!(matches!(err, QuizError::Finished));

    let snapshot = app.state.quizzes.snapshot(&session_id, TUTOR).await.unwrap();
    assert!(snapshot.completed);
    assert_eq!(snapshot.correct_count, 10);
    assert!(snapshot.question_results.iter().all(|r| *r == Some(true)));
    assert_eq!(app.state.quizzes.tracked_sessions(), 0);
}

#[tokio::test]
async fn difficulty_steps_down_after_two_misses() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;

    pass_round(&app, &session_id).await;
    pass_round(&app, &session_id).await;
    let first_miss = exhaust_round(&app, &session_id).await;
    assert_eq!(first_miss.difficulty, Difficulty::Medium);
    let second_miss = exhaust_round(&app, &session_id).await;
    assert_eq!(second_miss.outcome, RoundOutcome::Exhausted);
    assert_eq!(second_miss.difficulty, Difficulty::Easy);
    assert_eq!(second_miss.correct_count, 2);
    assert_eq!(second_miss.advance_after_ms, Some(ADVANCE_AFTER_EXHAUSTED_MS));

    app.state
        .quizzes
        .load_question(&session_id, STUDENT)
        .await
        .unwrap();
    assert_eq!(
        app.llm.requested_difficulties(),
        vec![
            Difficulty::Easy,
            Difficulty::Easy,
            Difficulty::Medium,
            Difficulty::Medium,
            Difficulty::Easy,
        ]
    );
}

#[tokio::test]
async fn submit_without_a_run_is_refused() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;
    let quiz = &app.state.quizzes;

    quiz.load_question(&session_id, STUDENT).await.unwrap();
    let err = quiz
        .submit(&session_id, STUDENT, PASSING_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, QuizError::RunFirst));

    let snapshot = quiz.snapshot(&session_id, STUDENT).await.unwrap();
    assert_eq!(snapshot.question_index, 0);
    assert_eq!(snapshot.attempt_count, 0);
    assert!(snapshot.current_question.is_some());
}

#[tokio::test]
async fn failed_submissions_retry_until_attempts_run_out() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;
    let quiz = &app.state.quizzes;

    quiz.load_question(&session_id, STUDENT).await.unwrap();
    for attempt in 1..=2 {
        let run = quiz.run(&session_id, STUDENT, FAILING_CODE).await.unwrap();
        assert_eq!(run.attempt_count, attempt);
        assert!(!run.run.all_passed());

        let report = quiz.submit(&session_id, STUDENT, FAILING_CODE).await.unwrap();
        assert_eq!(report.outcome, RoundOutcome::Retry);
        assert_eq!(report.feedback, "Some tests are failing. Check your code.");
        assert_eq!(report.advance_after_ms, None);
    }

    quiz.run(&session_id, STUDENT, FAILING_CODE).await.unwrap();
    let err = quiz
        .run(&session_id, STUDENT, FAILING_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, QuizError::AttemptsExhausted(3)));

    let report = quiz.submit(&session_id, STUDENT, FAILING_CODE).await.unwrap();
    assert_eq!(report.outcome, RoundOutcome::Exhausted);
    assert_eq!(report.attempt_count, 3);
    assert_eq!(report.next_question_index, Some(1));

    let session = app.state.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.questions.len(), 1);
    assert_eq!(session.questions[0].passed, Some(false));
    assert_eq!(session.questions[0].attempt_count, 3);
}

#[tokio::test]
async fn evaluator_verdict_overrides_local_results() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;
    let quiz = &app.state.quizzes;

    app.llm.push_evaluation(Ok(EvaluationReply {
        passed: true,
        feedback: "Right idea, the edge cases are fine.".to_string(),
        failed_tests: Vec::new(),
        correct_count: 2,
        total_tests: 2,
    }));

    quiz.load_question(&session_id, STUDENT).await.unwrap();
    quiz.run(&session_id, STUDENT, FAILING_CODE).await.unwrap();
    let report = quiz.submit(&session_id, STUDENT, FAILING_CODE).await.unwrap();

    assert_eq!(report.outcome, RoundOutcome::Passed);
    assert_eq!(report.feedback, "Right idea, the edge cases are fine.");
    assert_eq!(report.correct_count, 1);
}

#[tokio::test]
async fn evaluator_outage_leaves_the_round_open() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;
    let quiz = &app.state.quizzes;

    app.llm
        .push_evaluation(Err(LlmError::Transport("connection reset".to_string())));

    quiz.load_question(&session_id, STUDENT).await.unwrap();
    quiz.run(&session_id, STUDENT, PASSING_CODE).await.unwrap();
    let err = quiz
        .submit(&session_id, STUDENT, PASSING_CODE)
        .await
        .unwrap_err();
    assert!(matches!(err, QuizError::Llm(LlmError::Transport(_))));

    let snapshot = quiz.snapshot(&session_id, STUDENT).await.unwrap();
    assert_eq!(snapshot.question_index, 0);
    assert_eq!(snapshot.attempt_count, 1);

    // Local fallback once the evaluator answers garbage.
    let report = quiz.submit(&session_id, STUDENT, PASSING_CODE).await.unwrap();
    assert_eq!(report.outcome, RoundOutcome::Passed);
    assert_eq!(report.feedback, "All tests passed!");
}

#[tokio::test]
async fn open_question_is_returned_again_and_hidden_cases_stay_hidden() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;
    let quiz = &app.state.quizzes;

    let first = quiz.load_question(&session_id, STUDENT).await.unwrap();
    let again = quiz.load_question(&session_id, STUDENT).await.unwrap();

    assert_eq!(first.question, again.question);
    assert_eq!(app.llm.requested_difficulties().len(), 1);
    assert_eq!(first.test_cases.len(), 2);
    assert!(first.test_cases.iter().all(|tc| !tc.is_hidden));
    assert!(first.starter_code.contains("function add()"));
}

#[tokio::test]
async fn only_the_student_drives_the_quiz() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;

    let err = app
        .state
        .quizzes
        .load_question(&session_id, TUTOR)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuizError::Session(SessionError::Forbidden { .. })
    ));

    let snapshot = app.state.quizzes.snapshot(&session_id, TUTOR).await.unwrap();
    assert_eq!(snapshot.total_questions, 10);
    assert!(snapshot.current_question.is_none());
}

#[tokio::test]
async fn quiz_is_closed_before_the_tutor_starts_it() {
    let app = common::spawn_app().await;
    let (call_id, session_id) = app.place_call().await;
    app.state.calls.accept(&call_id, TUTOR).await.unwrap();

    let err = app
        .state
        .quizzes
        .load_question(&session_id, STUDENT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuizError::Session(SessionError::Forbidden {
            phase: SessionStatus::Teaching,
            ..
        })
    ));
}

#[tokio::test]
async fn tutor_view_does_not_wait_on_question_generation() {
    let app = common::spawn_app().await;
    let session_id = app.session_in_quiz().await;
    app.llm.stall_questions(true);

    let quizzes = app.state.quizzes.clone();
    let sid = session_id.clone();
    let pending = tokio::spawn(async move { quizzes.load_question(&sid, STUDENT).await });
    while app.llm.question_requests.lock().unwrap().is_empty() {
        tokio::task::yield_now().await;
    }

    let snapshot = tokio::time::timeout(
        Duration::from_secs(2),
        app.state.quizzes.snapshot(&session_id, TUTOR),
    )
    .await
    .expect("observer read blocked behind the model call")
    .unwrap();
    assert_eq!(snapshot.question_index, 0);
    assert!(snapshot.current_question.is_none());

    let err = app
        .state
        .quizzes
        .load_question(&session_id, STUDENT)
        .await
        .unwrap_err();
    assert!(matches!(err, QuizError::RoundInFlight));

    // An abandoned request releases the round.
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());
    app.llm.stall_questions(false);
    let view = app
        .state
        .quizzes
        .load_question(&session_id, STUDENT)
        .await
        .unwrap();
    assert_eq!(view.index, 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_quizzes_are_dropped_after_idle_retention() {
    let app = common::spawn_app().await;
    let abandoned = app.session_in_quiz().await;
    app.state
        .quizzes
        .load_question(&abandoned, STUDENT)
        .await
        .unwrap();
    assert_eq!(app.state.quizzes.tracked_sessions(), 1);

    tokio::time::advance(QUIZ_IDLE_RETENTION + Duration::from_secs(1)).await;

    let active = app.session_in_quiz().await;
    app.state.quizzes.load_question(&active, STUDENT).await.unwrap();
    assert_eq!(app.state.quizzes.tracked_sessions(), 1);

    // The abandoned quiz resumes from the stored session.
    let view = app
        .state
        .quizzes
        .load_question(&abandoned, STUDENT)
        .await
        .unwrap();
    assert_eq!(view.index, 0);
    assert_eq!(app.state.quizzes.tracked_sessions(), 2);
}

#[tokio::test]
async fn failed_completion_is_retried_on_next_load() {
    let store = Arc::new(FlakyStore::failing_topic_writes(1));
    store.inner.seed_content(common::seed()).await.unwrap();
    let config = Config {
        quiz_total_questions: 1,
        ..common::test_config()
    };
    let state = AppState::with_collaborators(
        config,
        store.clone(),
        Arc::new(FakeLlm::default()),
        Arc::new(SumExecutor),
    );
    let placed = state
        .calls
        .place_call(StartCallRequest {
            student_id: STUDENT.to_string(),
            student_name: None,
            tutor_id: TUTOR.to_string(),
            topic_id: BEGINNER_TOPIC.to_string(),
        })
        .await
        .unwrap();
    let session_id = placed.session_id;
    state.calls.accept(&placed.call.id, TUTOR).await.unwrap();
    state.sessions.start_quiz(&session_id, TUTOR).await.unwrap();

    let quiz = &state.quizzes;
    quiz.load_question(&session_id, STUDENT).await.unwrap();
    quiz.run(&session_id, STUDENT, PASSING_CODE).await.unwrap();
    let report = quiz.submit(&session_id, STUDENT, PASSING_CODE).await.unwrap();
    assert!(report.quiz_completed);
    assert_eq!(report.xp_earned, None);
    let session = state.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Quiz);

    let err = quiz.load_question(&session_id, STUDENT).await.unwrap_err();
    assert!(matches!(err, QuizError::Finished));

    let session = state.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.correct_count, 1);
    assert_eq!(session.total_score, 1);
    let progress = store.get_user_progress(STUDENT).await.unwrap();
    assert_eq!(progress.total_xp, 10);
    assert!(progress.beginner_progress[BEGINNER_TOPIC].completed);
    assert_eq!(quiz.tracked_sessions(), 0);
}
