//! Catalog models and their row conversions.
//!
//! Timestamps are stored as unix seconds (INTEGER columns); the conversions
//! in this module are the only place that mapping lives.

use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// A binary that has been observed locally and is eligible for scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Object name; identity and join key for results.
    pub name: String,
    /// When the artifact was first catalogued.
    pub first_seen: UtcDateTime,
}

/// A rule source that has been loaded into a ruleset at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    pub name: String,
    pub loaded_at: UtcDateTime,
}

/// One matched rule from one scan pass over one artifact.
///
/// Append-only: scanning the same artifact again with the same matches
/// produces new rows, never an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub artifact: String,
    pub rule: String,
    pub namespace: String,
    pub score: i64,
    pub detected_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ArtifactRow {
    name: String,
    first_seen: i64,
}
impl TryFrom<ArtifactRow> for Artifact {
    type Error = Error;
    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(Self {
            name: row.name,
            first_seen: UtcDateTime::from_unix_timestamp(row.first_seen)
                .or_raise(|| ErrorKind::InvalidData("first_seen timestamp"))?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct RuleRow {
    name: String,
    loaded_at: i64,
}
impl TryFrom<RuleRow> for RuleSource {
    type Error = Error;
    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            name: row.name,
            loaded_at: UtcDateTime::from_unix_timestamp(row.loaded_at)
                .or_raise(|| ErrorKind::InvalidData("loaded_at timestamp"))?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct DetectionRow {
    artifact_name: String,
    rule_name: String,
    namespace: String,
    score: i64,
    detected_at: i64,
}
impl TryFrom<DetectionRow> for Detection {
    type Error = Error;
    fn try_from(row: DetectionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            artifact: row.artifact_name,
            rule: row.rule_name,
            namespace: row.namespace,
            score: row.score,
            detected_at: UtcDateTime::from_unix_timestamp(row.detected_at)
                .or_raise(|| ErrorKind::InvalidData("detected_at timestamp"))?,
        })
    }
}
