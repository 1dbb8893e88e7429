//! Error taxonomy shared by the ingestion and query flows.
//!
//! | Error | Scope | Retryable |
//! |-------|-------|-----------|
//! | [`LoadError`] | one document | no |
//! | [`EmbeddingServiceError`] | one call | rate limits, timeouts, outages |
//! | [`IndexServiceError`] | one call | timeouts, outages |
//! | [`GenerationServiceError`] | one call | rate limits, timeouts, outages |
//! | [`ConfigurationError`] | process | never |
//!
//! [`QueryError`] is what a failed query surfaces; it remembers the state
//! the query was in when it failed.

use thiserror::Error;

use crate::models::QueryState;

/// Mis-configuration detected at startup or first use. Never retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("embedding dimensionality mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("similarity metric mismatch: index uses {actual}, configured {expected}")]
    MetricMismatch { expected: String, actual: String },
    #[error("similarity metric missing or unknown: {0}")]
    MissingMetric(String),
    #[error("invalid chunking parameters: {0}")]
    InvalidChunking(String),
    #[error("{0}")]
    Invalid(String),
}

/// A document could not be turned into text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("document {document_id}: unsupported format '{format}'")]
    Unsupported { document_id: String, format: String },
    #[error("document {document_id}: {format} extraction failed: {cause}")]
    Corrupt {
        document_id: String,
        format: String,
        cause: String,
    },
    #[error("document {document_id}: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        document_id: String,
        size: usize,
        limit: usize,
    },
    #[error("document {document_id}: no extractable text")]
    Empty { document_id: String },
}

impl LoadError {
    pub fn document_id(&self) -> &str {
        match self {
            LoadError::Unsupported { document_id, .. }
            | LoadError::Corrupt { document_id, .. }
            | LoadError::TooLarge { document_id, .. }
            | LoadError::Empty { document_id } => document_id,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingServiceError {
    #[error("embedding service rate limited: {0}")]
    RateLimited(String),
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl EmbeddingServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingServiceError::RateLimited(_)
                | EmbeddingServiceError::Unavailable(_)
                | EmbeddingServiceError::Timeout
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexServiceError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error("vector index request timed out")]
    Timeout,
    #[error("vector index rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid vector index response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl IndexServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexServiceError::Unavailable(_) | IndexServiceError::Timeout
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationServiceError {
    #[error("generation service rate limited: {0}")]
    RateLimited(String),
    #[error("prompt exceeds the generator context window: {0}")]
    ContextTooLong(String),
    #[error("generation service unavailable: {0}")]
    Unavailable(String),
    #[error("generation request timed out")]
    Timeout,
    #[error("generation request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid generation response: {0}")]
    InvalidResponse(String),
}

impl GenerationServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationServiceError::RateLimited(_)
                | GenerationServiceError::Unavailable(_)
                | GenerationServiceError::Timeout
        )
    }
}

/// Why a query ended in `FAILED`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error(transparent)]
    Embedding(#[from] EmbeddingServiceError),
    #[error(transparent)]
    Index(#[from] IndexServiceError),
    #[error(transparent)]
    Generation(#[from] GenerationServiceError),
}

impl QueryError {
    /// The state the query was in when this error ended it.
    pub fn failed_in(&self) -> QueryState {
        match self {
            QueryError::EmptyQuestion => QueryState::Received,
            QueryError::Embedding(_) => QueryState::EmbeddingQuery,
            QueryError::Index(_) => QueryState::Retrieving,
            QueryError::Generation(GenerationServiceError::ContextTooLong(_)) => {
                QueryState::BuildingPrompt
            }
            QueryError::Generation(_) => QueryState::Generating,
        }
    }

    /// Short message suitable for showing to the person who asked.
    pub fn user_message(&self) -> &'static str {
        match self {
            QueryError::EmptyQuestion => "Please ask a question.",
            QueryError::Embedding(_) | QueryError::Index(_) => {
                "Sorry, I couldn't search the documents right now. Please try again later."
            }
            QueryError::Generation(GenerationServiceError::ContextTooLong(_)) => {
                "Sorry, that question is too long for me to answer. Please shorten it."
            }
            QueryError::Generation(_) => {
                "Sorry, I encountered an error while writing the answer. Please try again later."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EmbeddingServiceError::RateLimited("429".into()).is_retryable());
        assert!(EmbeddingServiceError::Timeout.is_retryable());
        assert!(!EmbeddingServiceError::from(ConfigurationError::DimensionMismatch {
            expected: 3,
            actual: 4
        })
        .is_retryable());
        assert!(IndexServiceError::Unavailable("down".into()).is_retryable());
        assert!(!IndexServiceError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(GenerationServiceError::Unavailable("503".into()).is_retryable());
        assert!(!GenerationServiceError::ContextTooLong("too long".into()).is_retryable());
    }

    #[test]
    fn test_query_error_stage() {
        let err = QueryError::from(IndexServiceError::Timeout);
        assert_eq!(err.failed_in(), QueryState::Retrieving);
        let err = QueryError::from(GenerationServiceError::ContextTooLong("x".into()));
        assert_eq!(err.failed_in(), QueryState::BuildingPrompt);
        let err = QueryError::from(GenerationServiceError::Timeout);
        assert_eq!(err.failed_in(), QueryState::Generating);
    }

    #[test]
    fn test_load_error_carries_document_id() {
        let err = LoadError::Corrupt {
            document_id: "handbook.pdf".into(),
            format: "pdf".into(),
            cause: "bad xref".into(),
        };
        assert_eq!(err.document_id(), "handbook.pdf");
        assert!(err.to_string().contains("bad xref"));
    }
}
