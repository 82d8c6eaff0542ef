//! Repository over the artifact, rule, and result tables.
//!
//! Write patterns are deliberately narrow: artifacts are idempotently
//! upserted (keyed by name, `first_seen` preserved), rules are upserted with
//! a refreshed `loaded_at`, and results are strictly appended. Nothing here
//! updates or deletes a result row.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{Artifact, ArtifactRow, Detection, DetectionRow, RuleRow, RuleSource};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;

/// Repository for catalog reads and writes.
///
/// Cheap to clone; every clone shares the same connection pool.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    /// Record an artifact, keyed by name.
    ///
    /// Idempotent: re-recording a known artifact is a no-op and preserves
    /// the original `first_seen` timestamp, so restarting the process never
    /// duplicates catalog rows or re-stamps discovery times.
    pub async fn upsert_artifact(&self, name: &str) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_artifact.sql"))
            .bind(name)
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Fetch one artifact by name.
    pub async fn get_artifact(&self, name: &str) -> Result<Option<Artifact>> {
        let row: Option<ArtifactRow> = sqlx::query_as(include_str!("../queries/get_artifact.sql"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Artifact::try_from).transpose()
    }

    /// Every catalogued artifact name, in stable order.
    ///
    /// This is the full-rescan work list: one scan request per returned name.
    pub async fn artifact_names(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(include_str!("../queries/list_artifact_names.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Record that a rule source has been loaded, refreshing `loaded_at`.
    pub async fn record_rule(&self, name: &str) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_rule.sql"))
            .bind(name)
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Every recorded rule source, in stable order.
    pub async fn rules(&self) -> Result<Vec<RuleSource>> {
        let rows: Vec<RuleRow> = sqlx::query_as(include_str!("../queries/list_rules.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(RuleSource::try_from).collect()
    }

    // =========================================================================
    // Results
    // =========================================================================

    /// Append one detection row. Never updates an existing row.
    pub async fn append_detection(&self, detection: &Detection) -> Result<()> {
        sqlx::query(include_str!("../queries/append_detection.sql"))
            .bind(&detection.artifact)
            .bind(&detection.rule)
            .bind(&detection.namespace)
            .bind(detection.score)
            .bind(detection.detected_at.unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// The most recent detections across all artifacts.
    ///
    /// This is the read side of the feed contract: every match the pipeline
    /// makes is eventually visible here.
    pub async fn recent_detections(&self, limit: u32) -> Result<Vec<Detection>> {
        let rows: Vec<DetectionRow> = sqlx::query_as(include_str!("../queries/recent_detections.sql"))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Detection::try_from).collect()
    }

    /// All detections for one artifact, oldest first.
    pub async fn detections_for(&self, artifact: &str) -> Result<Vec<Detection>> {
        let rows: Vec<DetectionRow> = sqlx::query_as(include_str!("../queries/detections_for.sql"))
            .bind(artifact)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Detection::try_from).collect()
    }

    /// Total number of detection rows.
    pub async fn detection_count(&self) -> Result<i64> {
        sqlx::query_scalar(include_str!("../queries/count_detections.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }
}
