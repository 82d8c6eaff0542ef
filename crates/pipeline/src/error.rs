//! Pipeline Error Types
//!
//! Only construction-time conditions surface as errors from this crate's
//! public API; steady-state per-item failures are reported through logs and
//! the owning worker moves on to the next item.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A configured directory does not exist
    #[display("missing directory: {}", _0.display())]
    MissingDirectory(#[error(not(source))] PathBuf),
    /// Failed to establish a filesystem watch
    #[display("filesystem watch error: {_0}")]
    Watch(#[error(not(source))] String),
    /// Catalog (persistence) failure
    #[display("catalog error")]
    Catalog,
    /// Ruleset failure
    #[display("ruleset error")]
    Rules,
    /// Object store failure
    #[display("object store error")]
    Store,
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Lifecycle violation: the pipeline has already been closed
    #[display("pipeline already closed")]
    Closed,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
