use std::path::PathBuf;

use dedup_index::IndexError;
use dedup_types::TypeError;
use thiserror::Error;

/// Errors from the descriptor pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot up to the configured bound is in use.
    #[error("descriptor pool exhausted: {limit} handles already open")]
    Exhausted { limit: usize },

    /// The OS refused to open the file.
    #[error("cannot open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The handle was released (or never belonged to this pool).
    #[error("stale descriptor handle")]
    StaleHandle,

    /// The process may not open enough files to run safely.
    #[error("file handle limit too low: {available} usable, at least {required} required")]
    LimitTooLow { available: u64, required: u64 },

    /// The OS handle limit could not be queried.
    #[error("cannot query file handle limit: {0}")]
    LimitQuery(std::io::Error),
}

/// Errors from block store operations.
///
/// Every error returned by the write path is fatal. The read path only
/// returns errors for failures it cannot degrade around (index store
/// transport failures, pool exhaustion with no progress, output I/O).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid stream name {name:?}: {reason}")]
    InvalidStreamName { name: String, reason: String },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    /// Every message in the error's source chain, outermost first.
    fn chain(err: &dyn std::error::Error) -> Vec<String> {
        let mut out = vec![err.to_string()];
        let mut next = err.source();
        while let Some(e) = next {
            out.push(e.to_string());
            next = e.source();
        }
        out
    }

    #[test]
    fn wrapped_errors_are_reported_once() {
        let err = StoreError::from(PoolError::LimitTooLow {
            available: 32,
            required: 50,
        });
        let messages = chain(&err);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            "file handle limit too low: 32 usable, at least 50 required"
        );
    }

    #[test]
    fn open_error_keeps_cause_in_source_only() {
        let err = StoreError::from(PoolError::Open {
            path: PathBuf::from("/nope"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        });
        assert_eq!(chain(&err), vec!["cannot open \"/nope\"", "gone"]);
    }

    #[test]
    fn index_and_io_errors_are_transparent() {
        let err = StoreError::from(IndexError::Closed);
        assert_eq!(chain(&err), vec!["index store is closed"]);
        let err = StoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.to_string(), "disk");
        assert!(err.source().is_none());
    }
}
