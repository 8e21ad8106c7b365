//! Error types for SeriesDB

use thiserror::Error;

/// Result type alias for SeriesDB operations
pub type Result<T> = std::result::Result<T, SeriesError>;

/// SeriesDB error types
#[derive(Error, Debug)]
pub enum SeriesError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (checksum mismatch, codec version fault)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// An engine invariant was violated (broken monotonicity, availability
    /// bounds exceeded, empty segment after initialization)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Transient contention, the caller should retry later
    #[error("Retry later: {0}")]
    RetryLater(String),

    /// A previous update did not complete and left its crash marker behind
    #[error("Incomplete update: {0}")]
    IncompleteUpdate(String),

    /// Invalid persistent data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Caller-side programming fault
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SeriesError {
    /// Check if the error is retryable by the retry runner
    pub fn is_retryable(&self) -> bool {
        matches!(self, SeriesError::RetryLater(_) | SeriesError::Io(_))
    }

    /// Check if the error indicates corrupt on-disk data
    pub fn is_corruption(&self) -> bool {
        matches!(self, SeriesError::Corruption(_))
    }
}
