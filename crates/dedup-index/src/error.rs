//! Error types for the index crate.

use dedup_types::Digest;

/// Errors from index store operations.
///
/// Every variant is fatal to the write path. The read path only treats an
/// absent entry (`Ok(None)`) as recoverable.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A batch tried to insert a digest that already has an entry.
    #[error("digest already indexed: {0}")]
    DuplicateDigest(Digest),

    /// The backing store cannot be reached or refused the request.
    #[error("index store unavailable: {0}")]
    Unavailable(String),

    /// The store was closed and can no longer serve requests.
    #[error("index store is closed")]
    Closed,

    /// A journal record could not be decoded.
    #[error("corrupt journal record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
