//! Storage error taxonomy.
//!
//! Every recoverable failure in the write path maps onto one of these
//! kinds; the propagation rules differ per kind (see the storage façade
//! and the pipeline writer). I/O failures below the block store are not
//! represented here: they are fatal and panic.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Sample timestamp is older than the sliding window; dropped.
    #[error("late write")]
    LateWrite,

    /// A merge is still in progress; the caller may retry.
    #[error("busy")]
    Busy,

    /// The active volume (or a buffer) has no room left.
    #[error("overflow")]
    Overflow,

    /// Malformed series name, unparseable number, limit violation.
    #[error("bad data: {0}")]
    BadData(String),

    /// Protocol-level framing violation. Carries the offending line and
    /// the caret position inside it.
    #[error("parser error: {message}")]
    ParseError { message: String, pos: usize },

    /// Read target is not materialized (no memory-mapped view).
    #[error("unavailable")]
    Unavailable,

    /// Operation attempted after close() began.
    #[error("closed")]
    Closed,
}

impl StorageError {
    pub fn bad_data(msg: impl Into<String>) -> Self {
        StorageError::BadData(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
