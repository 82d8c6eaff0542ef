//! Ruleset Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A ruleset error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for ruleset operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Rule source failed to compile
    #[display("rule compilation failed: {_0}")]
    Compile(#[error(not(source))] String),
    /// Engine failed while scanning (including scan timeouts)
    #[display("scan failed: {_0}")]
    Scan(#[error(not(source))] String),
    /// `get_rules` called before the initial load published a generation
    #[display("no ruleset generation has been published yet")]
    NotLoaded,
    /// Rule directory missing at construction
    #[display("rule directory not found: {}", _0.display())]
    RuleDirMissing(#[error(not(source))] PathBuf),
    /// Underlying I/O error reading a rule source
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Scan(_) | Self::Io(_))
    }
}
