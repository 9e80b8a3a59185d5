use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid digest character {ch:?} at position {position}")]
    InvalidHex { ch: char, position: usize },

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("block of {0} bytes does not fit the length prefix")]
    BlockTooLarge(usize),
}
