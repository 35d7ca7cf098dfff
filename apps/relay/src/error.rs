use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatkey_shared::error::ChatKeyError;

/// Newtype wrapper for `ChatKeyError` that implements `IntoResponse`.
pub struct ServerError(pub ChatKeyError);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ChatKeyError::NotFound => (StatusCode::NOT_FOUND, self.0.to_string()),
            ChatKeyError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ChatKeyError::Unreachable => (StatusCode::NOT_FOUND, self.0.to_string()),
            ChatKeyError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ChatKeyError::Internal(msg) | ChatKeyError::Crypto(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ChatKeyError> for ServerError {
    fn from(e: ChatKeyError) -> Self {
        ServerError(e)
    }
}
