//! Object Store Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction, mirroring the error design of the other crates in this
//! workspace.

use derive_more::{Display, Error};
use std::io::Error as IoError;

/// An object store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for object store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Object does not exist in the bucket
    #[display("object not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Network-related error (connection, throttling, truncated body, etc.)
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Key contains characters that cannot become a local file name
    #[display("invalid object key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// Backend-specific error
    #[display("store error: {_0}")]
    Backend(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Network(_) | Self::Backend(_))
    }
}
