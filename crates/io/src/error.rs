//! Error types for Tensile binary I/O.

use thiserror::Error;

/// Errors raised while encoding or decoding binary records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Unexpected end of stream
    #[error("unexpected end of stream: needed {needed} more bytes while reading {context}")]
    EndOfStream { needed: usize, context: String },

    /// Invalid data content
    #[error("invalid data in {context}: {reason}")]
    InvalidData { context: String, reason: String },

    /// A length or count exceeded its cap
    #[error("{what} of {value} exceeds limit {limit}")]
    LimitExceeded {
        what: String,
        value: u64,
        limit: u64,
    },

    /// Invalid position for a seek
    #[error("position {position} out of bounds for length {length}")]
    OutOfBounds { position: usize, length: usize },
}

/// Result type for I/O operations.
pub type IoResult<T> = std::result::Result<T, IoError>;

impl IoError {
    /// Creates an end-of-stream error.
    pub fn end_of_stream(needed: usize, context: impl Into<String>) -> Self {
        Self::EndOfStream {
            needed,
            context: context.into(),
        }
    }

    /// Creates an invalid-data error.
    pub fn invalid_data(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidData {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Creates a limit-exceeded error.
    pub fn limit_exceeded(what: impl Into<String>, value: u64, limit: u64) -> Self {
        Self::LimitExceeded {
            what: what.into(),
            value,
            limit,
        }
    }
}
