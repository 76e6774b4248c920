use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Conflicting operation in flight: {0}")]
    Conflict(String),

    #[error("Sub-graph construction failed: {0}")]
    ConstructionFailure(String),

    #[error("Lookback buffer is empty")]
    BufferUnderrun,

    #[error("Connection failed [{endpoint}]: {reason}")]
    ConnectionFailure { endpoint: String, reason: String },

    #[error("Signaling protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        // Always 200 OK, callers branch on the success field
        StatusCode::OK
    }

    /// Stable machine-readable name of the failure class
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::UnknownSource(_) => "unknown_source",
            AppError::Timeout(_) => "timeout",
            AppError::Conflict(_) => "conflict",
            AppError::ConstructionFailure(_) => "construction_failure",
            AppError::BufferUnderrun => "buffer_underrun",
            AppError::ConnectionFailure { .. } => "connection_failure",
            AppError::ProtocolViolation(_) => "protocol_violation",
            AppError::Graph(_) => "graph",
            AppError::Signaling(_) => "signaling",
            AppError::WebRtcError(_) => "webrtc",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            kind: self.kind(),
            message: self.to_string(),
        };

        tracing::error!(
            error_kind = body.kind,
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(AppError::UnknownSource("7".into()).kind(), "unknown_source");
        assert_eq!(AppError::BufferUnderrun.kind(), "buffer_underrun");
        let err = AppError::ConnectionFailure {
            endpoint: "ws://localhost:8443".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.kind(), "connection_failure");
        assert!(err.to_string().contains("ws://localhost:8443"));
    }
}
