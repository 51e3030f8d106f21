use thiserror::Error;

/// Failure kinds raised by the ingestion and retrieval pipeline.
///
/// The HTTP layer maps each kind to a status code; everything the caller
/// can fix (bad upload, empty query) is a client error, everything that
/// depends on a backing service (embedder, store, model daemon) is a
/// server error.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("file type {0} is not allowed")]
    UnsupportedFormat(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("query must not be empty")]
    QueryEmpty,

    #[error("could not extract text: {0}")]
    ParseFailed(String),

    #[error("embedding request failed: {0}")]
    EmbeddingFailed(String),

    #[error("vector store failure: {0}")]
    VectorStoreFailed(#[from] sqlx::Error),

    #[error("language model unreachable: {0}")]
    LlmUnreachable(String),

    #[error("language model timed out")]
    LlmTimeout,

    #[error(
        "collection was built with embedding model '{stored}' but '{configured}' is configured; \
         delete the collection directory to reindex"
    )]
    EmbeddingModelMismatch { stored: String, configured: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RagError {
    /// True for failures the caller caused and can correct; these surface
    /// as 4xx and are never worth retrying unchanged.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RagError::UnsupportedFormat(_)
                | RagError::TooLarge { .. }
                | RagError::QueryEmpty
                | RagError::ParseFailed(_)
        )
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
