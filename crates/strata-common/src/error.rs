//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Block collection errors
    #[error("out of blocks: allocation bitmap is saturated")]
    OutOfBlocks,

    #[error("invalid block handle: {0}")]
    InvalidHandle(u64),

    #[error("collection is read-only")]
    ReadOnly,

    #[error("collection is not open")]
    NotOpen,

    // B+ tree errors
    #[error("key not found")]
    KeyNotFound,

    #[error("tree invariant violated: {0}")]
    InvariantViolated(String),

    #[error("builder already finalized")]
    BuilderFinalized,

    #[error("invalid tree parameters: {reason}")]
    InvalidParameters { reason: String },
}
