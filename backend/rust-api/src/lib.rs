use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod errors;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

/// Adds a Content-Security-Policy header to every response.
async fn csp_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; connect-src 'self'"),
    );
    response
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1", api_routes().layer(cors))
        .with_state(app_state)
        .layer(middleware::from_fn(csp_middleware))
        .layer(middleware::from_fn(middlewares::metrics::metrics_middleware))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(content_routes())
        .merge(call_routes())
        .merge(session_routes())
        .merge(assessment_routes())
        .route("/transport/token", post(handlers::transport::room_token))
}

fn content_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/topics", get(handlers::content::list_topics))
        .route(
            "/topics/{id}/levels/{level}/problems",
            get(handlers::content::level_problems),
        )
        .route(
            "/beginner/topics/{id}",
            get(handlers::content::beginner_topic),
        )
        .route("/users/{id}/progress", get(handlers::content::user_progress))
}

fn call_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/calls", post(handlers::calls::start_call))
        .route("/calls/{id}", get(handlers::calls::get_call))
        .route("/calls/{id}/accept", post(handlers::calls::accept_call))
        .route("/calls/{id}/decline", post(handlers::calls::decline_call))
        .route("/calls/{id}/cancel", post(handlers::calls::cancel_call))
        .route("/calls/{id}/end", post(handlers::calls::end_call))
        .route("/calls/{id}/stream", get(handlers::sse::call_stream))
        .route("/tutors/online", get(handlers::calls::online_tutors))
        .route("/tutors/{id}/incoming", get(handlers::calls::incoming_calls))
        .route(
            "/tutors/{id}/incoming/stream",
            get(handlers::sse::incoming_stream),
        )
        .route("/tutors/{id}/presence", put(handlers::calls::set_presence))
}

fn session_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/{id}", get(handlers::sessions::get_session))
        .route("/sessions/{id}/stream", get(handlers::sse::session_stream))
        .route(
            "/sessions/{id}/start-quiz",
            post(handlers::sessions::start_quiz),
        )
        .route("/sessions/{id}/quiz", get(handlers::quiz::quiz_snapshot))
        .route(
            "/sessions/{id}/quiz/question",
            post(handlers::quiz::load_question),
        )
        .route("/sessions/{id}/quiz/run", post(handlers::quiz::run_code))
        .route(
            "/sessions/{id}/quiz/submit",
            post(handlers::quiz::submit_code),
        )
}

fn assessment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/levels/{topic}/{level}/attempts",
            post(handlers::assessment::start_attempt),
        )
        .route("/attempts/{id}", get(handlers::assessment::get_attempt))
        .route("/attempts/{id}/run", post(handlers::assessment::run_attempt))
        .route(
            "/attempts/{id}/submit",
            post(handlers::assessment::submit_attempt),
        )
        .route("/attempts/{id}/chat", post(handlers::assessment::chat))
}
