use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for admission operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Admission error types
///
/// None of these ever reach a request that is being admitted: the decider maps
/// every variant onto a fallback. They surface only on the administrative
/// surface and during startup.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Counter store timed out after {0}ms")]
    StoreTimeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Metrics write failed: {0}")]
    MetricsWrite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::StoreTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdmissionError::MetricsWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::StoreUnavailable(err.to_string())
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AdmissionError::StoreUnavailable("down".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AdmissionError::StoreTimeout(50).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AdmissionError::InvalidRequest("hour 25".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AdmissionError::Config("bad".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_redis_errors_are_store_unavailable() {
        let err = AdmissionError::from(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        assert!(matches!(err, AdmissionError::StoreUnavailable(_)));
    }

    #[test]
    fn test_error_display() {
        let err = AdmissionError::StoreTimeout(50);
        assert_eq!(err.to_string(), "Counter store timed out after 50ms");
    }
}
