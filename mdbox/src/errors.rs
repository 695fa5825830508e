//! Error and result types for box-tree operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while building, paging, saving or loading a box tree.
///
/// Non-fatal conditions (an inverse volume that disagrees with the stored
/// value, missing provenance entries) are not errors; they are reported with
/// `log::warn!` and the operation continues.
#[derive(Debug, Error)]
pub enum BoxTreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The container cannot be opened or created, or is open read-only when
    /// write access is required.
    #[error("File access error: {0}")]
    FileAccess(String),

    /// Stored dimensionality, record type or parallel array lengths disagree
    /// with the request or with each other.
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    /// An existing container declares a dimensionality different from the
    /// one supplied by the caller.
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl BoxTreeError {
    pub(crate) fn array_length(group: &str, array: &str, expected: u64, actual: u64) -> Self {
        BoxTreeError::FormatMismatch(format!(
            "array '{}/{}' has {} rows, expected {}",
            group, array, actual, expected
        ))
    }
}

impl From<bincode::error::EncodeError> for BoxTreeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BoxTreeError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BoxTreeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BoxTreeError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BoxTreeError {
    fn from(err: serde_json::Error) -> Self {
        BoxTreeError::Serialization(err.to_string())
    }
}

/// Result type for box-tree operations
pub type BoxResult<T> = Result<T, BoxTreeError>;
