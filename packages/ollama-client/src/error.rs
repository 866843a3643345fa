//! Error types for Ollama client

use thiserror::Error;

/// Errors that can occur when interacting with Ollama
#[derive(Error, Debug)]
pub enum OllamaError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Failed to serialize/deserialize JSON
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Ollama API returned an error
    #[error("Ollama API error (status {status}): {body}")]
    ApiError { status: u16, body: String },

    /// The server refused the request because of request volume
    #[error("Rate limited by model backend")]
    RateLimited {
        /// Seconds suggested by the `Retry-After` header, when present
        retry_after_secs: Option<u64>,
    },

    /// Model not found or not pulled
    #[error("Model not found: {0}. Try running 'ollama pull {0}'")]
    ModelNotFound(String),

    /// Request timeout
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The response stream broke off mid-way
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Connection refused (Ollama not running)
    #[error("Connection refused. Is Ollama running at {0}?")]
    ConnectionRefused(String),
}

impl OllamaError {
    /// Whether the backend asked us to slow down
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, OllamaError::RateLimited { .. })
    }

    /// Transient failures that may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OllamaError::Timeout(_)
                | OllamaError::ConnectionRefused(_)
                | OllamaError::RateLimited { .. }
        )
    }
}

/// Result type for Ollama operations
pub type OllamaResult<T> = Result<T, OllamaError>;
