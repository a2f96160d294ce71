use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::sync::Arc;

use crate::config::StoreBackend;
use crate::metrics;
use crate::services::AppState;

pub mod assessment;
pub mod calls;
pub mod content;
pub mod quiz;
pub mod sessions;
pub mod sse;
pub mod transport;

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = match state.config.store_backend {
        StoreBackend::Mongo => "mongo",
        StoreBackend::Memory => "memory",
    };

    let store = match tokio::time::timeout(std::time::Duration::from_secs(1), state.store.ping())
        .await
    {
        Ok(Ok(())) => json!({ "status": "healthy", "backend": backend }),
        Ok(Err(e)) => json!({
            "status": "unhealthy",
            "backend": backend,
            "error": format!("Store error: {:#}", e),
        }),
        Err(_) => json!({
            "status": "unhealthy",
            "backend": backend,
            "error": "Store timeout after 1s",
        }),
    };

    let healthy = store["status"] == "healthy";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "codetutor-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": { "store": store },
        })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// Protects /metrics with HTTP Basic auth (`METRICS_AUTH=user:password`).
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let expected = std::env::var("METRICS_AUTH").unwrap_or_else(|_| "admin:changeme".to_string());
    if credentials != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
