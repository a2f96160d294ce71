use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Call, session, attempt or tutor addressed by an API path.
fn subject(path: &str) -> Option<(&'static str, &str)> {
    let mut segments = path.split('/').skip_while(|s| *s != "v1").skip(1);
    let kind = match segments.next()? {
        "calls" => "call",
        "sessions" => "session",
        "attempts" => "attempt",
        "tutors" => "tutor",
        _ => return None,
    };
    segments
        .next()
        .filter(|id| !id.is_empty() && *id != "online")
        .map(|id| (kind, id))
}

/// Propagates `x-trace-id` (minting one when absent) and runs the request
/// inside a span tagged with the entity it addresses.
pub async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(&TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header = HeaderValue::from_str(&trace_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(TRACE_ID_HEADER, value.clone());
    }

    let path = request.uri().path().to_owned();
    let (kind, id) = subject(&path).unwrap_or(("none", ""));
    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %path,
        subject = kind,
        subject_id = %id,
    );
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header {
        response.headers_mut().entry(TRACE_ID_HEADER).or_insert(value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_names_the_addressed_entity() {
        assert_eq!(
            subject("/api/v1/calls/abc/accept"),
            Some(("call", "abc"))
        );
        assert_eq!(
            subject("/api/v1/sessions/s-1/quiz/run"),
            Some(("session", "s-1"))
        );
        assert_eq!(subject("/api/v1/tutors/t-9/presence"), Some(("tutor", "t-9")));
        assert_eq!(subject("/api/v1/tutors/online"), None);
        assert_eq!(subject("/api/v1/topics"), None);
        assert_eq!(subject("/health"), None);
    }
}
