use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use duo_shared::{ConnectionId, ProtocolError, UserId};

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Upload too large: {size} bytes (max {max})")]
    UploadTooLarge { size: usize, max: usize },

    #[error("Upload storage error: {0}")]
    UploadStorage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::UploadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::UploadStorage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Upload storage error".to_string(),
            ),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Errors raised while handling a single client event. None of them affect
/// any other connection.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HubError {
    /// Whether the client should be told its request was rejected.
    pub fn is_client_facing(&self) -> bool {
        matches!(self, HubError::Malformed(_) | HubError::Protocol(_))
    }
}
