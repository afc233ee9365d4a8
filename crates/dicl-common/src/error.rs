//! Error types for the DICL service
//!
//! Provides a unified error type and the embedding-provider error variants.
//! Schema validation failures are deliberately absent: a structured output that
//! does not match its schema is a quality flag on the response, not an error.

use thiserror::Error;

/// Result type alias using DiclError
pub type Result<T> = std::result::Result<T, DiclError>;

/// Unified error type for DICL operations
#[derive(Debug, Error)]
pub enum DiclError {
    // Embedding provider failure or timeout
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    // Store connectivity or malformed query (an empty result is not an error)
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    // Query / partition embedding length disagreement
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Batch upsert rejected as a whole
    #[error("Store write rejected: {0}")]
    StoreWrite(String),

    // Generation model failure
    #[error("Generation error: {0}")]
    Generation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Unknown function, variant or record
    #[error("Not found: {0}")]
    NotFound(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DiclError {
    /// Configuration-class errors are never retried: they will fail the same way again.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DiclError::Config(_) | DiclError::DimensionMismatch { .. } | DiclError::NotFound(_)
        )
    }

    /// Transient errors may succeed on a later attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            DiclError::Embedding(e) => e.is_transient(),
            DiclError::Retrieval(_) | DiclError::Generation(_) | DiclError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Errors from embedding providers
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Service unavailable")]
    Unavailable,

    #[error("Embedding request timed out after {0}ms")]
    Timeout(u64),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::ApiError(_)
                | EmbeddingError::RateLimited
                | EmbeddingError::Unavailable
                | EmbeddingError::Timeout(_)
        )
    }
}

// Implement From for common external error types
impl From<serde_json::Error> for DiclError {
    fn from(err: serde_json::Error) -> Self {
        DiclError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DiclError {
    fn from(err: anyhow::Error) -> Self {
        DiclError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiclError::DimensionMismatch {
            expected: 1536,
            actual: 768,
        };
        assert!(err.to_string().contains("expected 1536, got 768"));
    }

    #[test]
    fn test_configuration_errors_are_not_retriable() {
        let err = DiclError::DimensionMismatch {
            expected: 3,
            actual: 4,
        };
        assert!(err.is_configuration());
        assert!(!err.is_retriable());

        let err = DiclError::Config("missing metric".into());
        assert!(err.is_configuration());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_transient_embedding_errors_are_retriable() {
        let err: DiclError = EmbeddingError::Timeout(500).into();
        assert!(err.is_retriable());

        let err: DiclError = EmbeddingError::InvalidInput("empty".into()).into();
        assert!(!err.is_retriable());
    }
}
