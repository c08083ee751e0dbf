//! Error types for the MainyDB engine.

use mainydb_codec::CodecError;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the document engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A filter document was malformed.
    #[error("bad query: {message}")]
    BadQuery {
        /// What was wrong with the filter.
        message: String,
    },

    /// An update document was malformed, conflicted with a value's type,
    /// or tried to modify `_id`.
    #[error("bad update: {message}")]
    BadUpdate {
        /// What was wrong with the update.
        message: String,
    },

    /// An aggregation stage or expression was malformed.
    #[error("bad pipeline: {message}")]
    BadPipeline {
        /// What was wrong with the pipeline.
        message: String,
    },

    /// A write violated a unique index.
    #[error("duplicate key for index {index:?}: {key}")]
    DuplicateKey {
        /// Name of the violated index.
        index: String,
        /// Rendering of the offending key tuple.
        key: String,
    },

    /// A named collection or index does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The store file failed header or decode validation.
    #[error("corrupt store file: {message}")]
    CorruptFile {
        /// Description of the corruption.
        message: String,
    },

    /// An I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation was cancelled through its cancel token.
    #[error("operation cancelled")]
    Cancelled,

    /// A field-encryption transform failed.
    #[error("encryption error: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Creates a bad-query error.
    pub fn bad_query(message: impl Into<String>) -> Self {
        Self::BadQuery {
            message: message.into(),
        }
    }

    /// Creates a bad-update error.
    pub fn bad_update(message: impl Into<String>) -> Self {
        Self::BadUpdate {
            message: message.into(),
        }
    }

    /// Creates a bad-pipeline error.
    pub fn bad_pipeline(message: impl Into<String>) -> Self {
        Self::BadPipeline {
            message: message.into(),
        }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate_key(index: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            index: index.into(),
            key: key.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
        }
    }

    /// Creates a corrupt-file error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptFile {
            message: message.into(),
        }
    }

    /// Creates an encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }
}

impl From<CodecError> for EngineError {
    /// Codec failures only arise while decoding the store file, so they
    /// surface as corruption.
    fn from(err: CodecError) -> Self {
        Self::CorruptFile {
            message: err.to_string(),
        }
    }
}
