//! Object store models.

use time::UtcDateTime;

/// Object metadata returned by listing operations.
///
/// Used by the sync pipeline to diff the bucket contents against the set of
/// artifacts already materialized locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key (flat namespace; becomes the local file name)
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp, when the backend reports one
    pub last_modified: Option<UtcDateTime>,
}
impl ObjectInfo {
    /// Create a new ObjectInfo from a listing operation.
    pub fn new(key: impl Into<String>, size: u64, last_modified: Option<UtcDateTime>) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified,
        }
    }
}
