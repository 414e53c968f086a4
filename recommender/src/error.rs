//! Error types for the recipe recommender.

use pantry_embeddings::EmbeddingError;
use thiserror::Error;

/// Result type alias for recommender operations.
pub type Result<T> = std::result::Result<T, RecommenderError>;

/// Errors that can occur in the recommender.
///
/// `CorpusLoad` and `IndexBuild` abort startup. `InvalidQuery` and
/// `RecommendationUnavailable` are per-request and returned to the caller.
/// `IndexCorrupt` is only produced while reading the asset cache and is
/// turned into a rebuild there.
#[derive(Error, Debug)]
pub enum RecommenderError {
    /// Recipe source missing or malformed.
    #[error("corpus load failed: {0}")]
    CorpusLoad(String),

    /// Embedding provider failure outside a request.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// The vector index could not be built.
    #[error("index build failed: {0}")]
    IndexBuild(String),

    /// Persisted assets could not be decoded.
    #[error("index cache corrupt: {0}")]
    IndexCorrupt(String),

    /// The request can never be answered as given.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The embedding provider failed while serving a request.
    #[error("recommendation unavailable: {0}")]
    RecommendationUnavailable(#[source] EmbeddingError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecommenderError {
    /// Whether the error is the caller's fault rather than the service's.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidQuery(_))
    }
}
