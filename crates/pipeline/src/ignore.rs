//! Tracking of artifacts already materialized locally.

use crate::error::{ErrorKind, Result};
use crate::sync::PARTIAL_SUFFIX;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;
use tokio::sync::RwLock;

/// The set of artifact names already present locally.
///
/// Read by the syncer's list-diff step, written by the periodic directory
/// refresher and by download workers on success. The set itself never leaves
/// this type; all access goes through `is_ignored`/`mark`/`refresh_from`.
/// Staleness between refreshes is tolerated — worst case the syncer fetches
/// a file it already has, and the refresher catches up on the next tick.
#[derive(Debug, Default)]
pub struct IgnoreTracker {
    known: RwLock<HashSet<String>>,
}

impl IgnoreTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is already materialized locally.
    pub async fn is_ignored(&self, name: &str) -> bool {
        self.known.read().await.contains(name)
    }

    /// Mark one name as present (e.g. right after a successful download).
    pub async fn mark(&self, name: impl Into<String>) {
        self.known.write().await.insert(name.into());
    }

    /// Mark every regular file in `dir` as present.
    ///
    /// Picks up artifacts that arrived by other means (pre-seeded, copied in
    /// by hand). In-progress downloads (`.part` temps) are skipped: they are
    /// not artifacts yet. Returns how many names were newly marked.
    pub async fn refresh_from(&self, dir: &Path) -> Result<usize> {
        let mut entries = fs::read_dir(dir).await.map_err(ErrorKind::Io)?;
        let mut marked = 0;
        let mut known = self.known.write().await;
        while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if known.insert(name) {
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Number of known names (test and log helper).
    pub async fn len(&self) -> usize {
        self.known.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.known.read().await.is_empty()
    }
}
