//! Error types for relay-ai

use std::time::Duration;
use thiserror::Error;

/// Result type alias using relay-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a completion provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The provider answered without any choices
    #[error("Completion returned no choices")]
    NoChoices,

    /// Model not found or not accessible with the configured key
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The BPE vocabulary could not be loaded
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("server_error")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }

    /// How long the provider asked us to back off, if it said
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => retry_after.map(Duration::from_secs),
            _ => None,
        }
    }

    /// Check if this error indicates the prompt did not fit the model context
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Api { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("context_length_exceeded")
                    || msg.contains("maximum context length")
                    || msg.contains("reduce the length")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_typed_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Sse("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_retryable_api_rate_limit_error_type() {
        let e = Error::api("rate_limit_error", "You have exceeded the rate limit");
        assert!(e.is_retryable());
    }

    #[test]
    fn test_retryable_api_too_many_requests() {
        let e = Error::api("error", "Too many requests");
        assert!(e.is_retryable());
    }

    #[test]
    fn test_not_retryable() {
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::NoChoices.is_retryable());
        assert!(!Error::api("invalid_request_error", "Invalid API key").is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let e = Error::RateLimited { retry_after: Some(20) };
        assert_eq!(e.retry_after(), Some(Duration::from_secs(20)));
        assert_eq!(Error::RateLimited { retry_after: None }.retry_after(), None);
        assert_eq!(Error::NoChoices.retry_after(), None);
    }

    #[test]
    fn test_context_overflow() {
        let e = Error::api(
            "invalid_request_error",
            "This model's maximum context length is 4097 tokens. context_length_exceeded",
        );
        assert!(e.is_context_overflow());
        assert!(!Error::NoChoices.is_context_overflow());
    }
}
