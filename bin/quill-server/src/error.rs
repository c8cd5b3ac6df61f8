//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Engine failures are logged with full detail but only a generic message is
//! returned, so engine URLs and upstream bodies never reach clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quill_core::ChatError;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

/// HTTP status used when the client went away before a response was ready.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// All errors that can occur in the quill-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the chat service.
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),

            ServerError::Chat(ChatError::EmptyConversation | ChatError::EmptyPrompt) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            // Nobody is listening; send no body.
            ServerError::Chat(ChatError::Cancelled) => {
                debug!("request cancelled by client");
                let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::REQUEST_TIMEOUT);
                return status.into_response();
            }
            ServerError::Chat(ChatError::Config(e)) => {
                error!(error = %e, "configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ServerError::Chat(ChatError::Engine(e)) => {
                error!(error = ?e, "generation engine error");
                (
                    StatusCode::BAD_GATEWAY,
                    "generation engine error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use quill_core::EngineError;

    use super::*;

    #[test]
    fn client_errors_expose_their_message() {
        let response = ServerError::Chat(ChatError::EmptyConversation).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn engine_errors_are_bad_gateway() {
        let err = ChatError::Engine(EngineError::Status {
            status: 500,
            body: "secret path".into(),
        });
        let response = ServerError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn cancellation_sends_no_body() {
        let response = ServerError::Chat(ChatError::Cancelled).into_response();
        assert_eq!(response.status().as_u16(), CLIENT_CLOSED_REQUEST);
    }
}
