//! Error types for the MainyDB codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input bytes do not form a valid encoded value.
    #[error("corrupt value encoding: {message}")]
    Corrupt {
        /// Description of what was wrong.
        message: String,
    },

    /// The input ended before a complete value was read.
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEnd {
        /// How many additional bytes were required.
        needed: usize,
    },

    /// Nesting exceeded the decoder's depth limit.
    #[error("value nesting exceeds depth limit of {limit}")]
    DepthLimit {
        /// The configured limit.
        limit: usize,
    },

    /// A text payload was not valid UTF-8.
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// Bytes remained after the top-level value was decoded.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },
}

impl CodecError {
    /// Creates a corrupt-encoding error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}
