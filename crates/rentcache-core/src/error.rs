//! Error types for backend calls and the sync layer.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::QueryKey;

/// Failures reported by a backend query, write, or push channel.
///
/// Clone is required: one in-flight fetch may be awaited by several callers,
/// and each of them receives the same error.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Rejected by backend: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    NetworkError(Arc<reqwest::Error>),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::NetworkError(Arc::new(e))
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl BackendError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 409 | 422 => BackendError::Rejected(truncated),
            401 => BackendError::Unauthorized,
            403 => BackendError::AccessDenied(truncated),
            404 => BackendError::NotFound(truncated),
            429 => BackendError::RateLimited,
            500..=599 => BackendError::ServerError(truncated),
            _ => BackendError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

/// Errors surfaced by the sync layer to its callers.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Sync layer is shut down")]
    ShutDown,

    #[error("No cached entry for {0}")]
    MissingEntry(QueryKey),

    #[error("Record {id} not found in {key}")]
    RecordNotFound { key: QueryKey, id: String },

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            BackendError::from_status(StatusCode::UNAUTHORIZED, ""),
            BackendError::Unauthorized
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            BackendError::RateLimited
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad amount"),
            BackendError::Rejected(ref body) if body == "bad amount"
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            BackendError::ServerError(_)
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::IM_A_TEAPOT, ""),
            BackendError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let truncated = BackendError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("520 total bytes"));

        assert_eq!(BackendError::truncate_body("short"), "short");
    }

    #[test]
    fn test_backend_error_converts_into_sync_error() {
        let err: SyncError = BackendError::Transient("socket closed".into()).into();
        assert_eq!(err.to_string(), "Transient failure: socket closed");
    }
}
