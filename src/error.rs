use std::sync::PoisonError;
use thiserror::Error;

/// Failure kinds surfaced by the retrieval core
#[derive(Debug, Error)]
pub enum RagError {
    /// The document had no non-whitespace text; nothing was written
    #[error("document contains no extractable text")]
    EmptyDocument,

    /// The persisted embedding snapshot could not be read back
    #[error("embedding snapshot is corrupt: {0}")]
    CorruptIndexSnapshot(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A vector holds NaN or infinite components
    #[error("embedding for {0} has non-finite components")]
    NonFiniteVector(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    /// The embedding index has not finished loading
    #[error("embedding index is not ready")]
    IndexNotReady,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for RagError {
    fn from(e: rusqlite::Error) -> Self {
        RagError::Storage(e.to_string())
    }
}

impl<T> From<PoisonError<T>> for RagError {
    fn from(e: PoisonError<T>) -> Self {
        RagError::Storage(format!("lock poisoned: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
