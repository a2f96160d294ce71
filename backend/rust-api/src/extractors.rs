use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use validator::Validate;

use crate::errors::ApiError;

fn bad_request(message: String) -> Response {
    tracing::warn!("{}", message);
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "message": message, "status": 400 })),
    )
        .into_response()
}

/// JSON body whose parse failures answer with the API's JSON error shape.
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| AppJson(value))
            .map_err(|rejection| {
                bad_request(format!("Failed to parse JSON request body: {}", rejection))
            })
    }
}

/// `AppJson` that also runs the body's `validator` rules.
pub struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: serde::de::DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let AppJson(value) = AppJson::<T>::from_request(req, state).await?;
        value
            .validate()
            .map_err(|e| ApiError::Validation(e.to_string()).into_response())?;
        Ok(ValidJson(value))
    }
}
