use thiserror::Error;

/// Application-wide error types for gather.
#[derive(Error, Debug)]
pub enum AppError {
    /// Source responded with a non-success status (304 is not an error).
    #[error("HTTP {status} for {url}")]
    FetchError { status: u16, url: String },

    /// Payload could not be parsed by the adapter.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Event failed required-field, date or geo checks.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Registry already holds a source with this id or URL.
    #[error("Duplicate source: {0}")]
    DuplicateSource(String),

    /// A scheduled job exceeded its timeout.
    #[error("Job '{job}' timed out after {seconds} seconds")]
    SchedulerTimeout { job: String, seconds: u64 },

    /// Circuit breaker rejected the call without running it.
    #[error("Circuit '{name}' is open, retry after {retry_after_secs} seconds")]
    CircuitOpen { name: String, retry_after_secs: u64 },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Other HTTP client failure (bad URL, body read, SSRF guard).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Snapshot, run-log or job-store I/O failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Collection request or job definition has an invalid shape.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Lookup by id found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::SchedulerTimeout { .. }
            | AppError::CircuitOpen { .. } => true,
            AppError::FetchError { status, .. } => *status == 429 || *status >= 500,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::FetchError { status, .. } => *status == 429 || *status >= 500,
            AppError::LlmError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Returns true for rate-limit style failures (429 or explicit limit).
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded
                | AppError::FetchError { status: 429, .. }
                | AppError::LlmError {
                    status_code: 429,
                    ..
                }
        )
    }

    pub fn parse(message: impl Into<String>) -> Self {
        AppError::ParseError(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::ValidationError(message.into())
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        AppError::StorageError(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(
            AppError::FetchError {
                status: 503,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::FetchError {
                status: 404,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(!AppError::ParseError("bad xml".into()).is_retryable());
        assert!(!AppError::DuplicateSource("a".into()).is_retryable());
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::RateLimitExceeded.should_trip_circuit());
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(
            AppError::FetchError {
                status: 500,
                url: "u".into()
            }
            .should_trip_circuit()
        );
        assert!(!AppError::ValidationError("bad".into()).should_trip_circuit());
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(
            AppError::FetchError {
                status: 429,
                url: "u".into()
            }
            .is_rate_limit()
        );
        assert!(!AppError::Timeout(1).is_rate_limit());
    }
}
