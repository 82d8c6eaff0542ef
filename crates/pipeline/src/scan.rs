//! Scan requests, the rescan trigger, and the scan worker pool.
//!
//! The workers drain one merged request stream. Two producers feed it —
//! the artifact watch bridge (new arrivals) and the rescan trigger (rule
//! changes) — with no ordering guarantee between them, only eventual
//! delivery of every request.

use quarry_catalog::Repository;
use quarry_rules::{ProviderHandle, RuleChange, RuleMatch, RulesetProvider};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// Scan request queue capacity; covers a full-catalog rescan burst.
pub(crate) const SCAN_QUEUE_CAPACITY: usize = 10_000;
/// Result queue capacity; a slow persister throttles the scan workers.
pub(crate) const RESULT_QUEUE_CAPACITY: usize = 1_000;

/// Why an artifact is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCause {
    /// The artifact just appeared in the artifact directory.
    NewArrival,
    /// The ruleset changed; the whole catalog is being re-evaluated.
    RuleChanged,
}

/// One unit of scan work: evaluate one artifact against the current ruleset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub artifact: String,
    pub cause: ScanCause,
}
impl ScanRequest {
    pub fn new_arrival(artifact: impl Into<String>) -> Self {
        Self { artifact: artifact.into(), cause: ScanCause::NewArrival }
    }

    pub fn rescan(artifact: impl Into<String>) -> Self {
        Self { artifact: artifact.into(), cause: ScanCause::RuleChanged }
    }
}

/// Everything one scan pass found in one artifact.
///
/// An empty batch is valid (and common): it records that the scan happened
/// and produces no rows.
#[derive(Debug, Clone)]
pub(crate) struct ArtifactMatches {
    pub(crate) artifact: String,
    pub(crate) matches: Vec<RuleMatch>,
}

/// Turn every rule change into a full-catalog rescan.
///
/// No incremental relevance analysis: rule sets are small and rescans are
/// rare next to artifact arrivals, so one request per catalogued artifact
/// is emitted and the queue's backpressure paces the burst.
pub(crate) async fn rescan_trigger(
    mut changes: mpsc::Receiver<RuleChange>,
    catalog: Repository,
    scan_tx: mpsc::Sender<ScanRequest>,
) {
    while let Some(change) = changes.recv().await {
        let names = match catalog.artifact_names().await {
            Ok(names) => names,
            Err(err) => {
                error!(rule = %change.name, "rescan skipped, catalog unavailable: {err}");
                continue;
            },
        };
        info!(rule = %change.name, artifacts = names.len(), "rule changed; scheduling full rescan");
        for name in names {
            if scan_tx.send(ScanRequest::rescan(name)).await.is_err() {
                debug!("scan queue closed; rescan trigger exiting");
                return;
            }
        }
    }
    debug!("rescan trigger exiting");
}

/// One scan worker: drain requests, snapshot the ruleset, scan with a
/// bounded timeout, emit the result batch.
///
/// Per-artifact failures (missing file, engine timeout) are reported and
/// the worker moves on; only a missing ruleset snapshot stops the loop,
/// and `Pipeline::start` makes that unreachable by publishing the initial
/// generation before any worker spawns.
pub(crate) async fn scan_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<ScanRequest>>>,
    provider: ProviderHandle,
    artifact_dir: PathBuf,
    timeout: Duration,
    results_tx: mpsc::Sender<ArtifactMatches>,
) {
    loop {
        // Lock held only while waiting for one request; siblings receive
        // concurrently with this worker's scan.
        let request = { queue.lock().await.recv().await };
        let Some(request) = request else { break };

        let snapshot = match provider.get_rules().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(worker, "no ruleset available, stopping worker: {err}");
                break;
            },
        };

        let path = artifact_dir.join(&request.artifact);
        let scan = tokio::task::spawn_blocking(move || snapshot.scan(&path, timeout)).await;
        let outcome = match scan {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(worker, artifact = %request.artifact, "scan task panicked: {err}");
                continue;
            },
        };
        match outcome {
            Ok(matches) => {
                debug!(
                    worker,
                    artifact = %request.artifact,
                    cause = ?request.cause,
                    matches = matches.len(),
                    "scan complete"
                );
                if results_tx
                    .send(ArtifactMatches { artifact: request.artifact, matches })
                    .await
                    .is_err()
                {
                    debug!(worker, "results channel closed; scan worker exiting");
                    break;
                }
            },
            Err(err) => warn!(worker, artifact = %request.artifact, "scan failed: {err}"),
        }
    }
    debug!(worker, "scan worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_catalog::Database;
    use quarry_rules::RuleChangeKind;

    #[tokio::test]
    async fn test_rescan_emits_one_request_per_artifact() {
        let db = Database::connect_in_memory().await.unwrap();
        let catalog = Repository::from(&db);
        for name in ["a.bin", "b.bin", "c.bin"] {
            catalog.upsert_artifact(name).await.unwrap();
        }

        let (changes_tx, changes_rx) = mpsc::channel(4);
        let (scan_tx, mut scan_rx) = mpsc::channel(16);
        let trigger = tokio::spawn(rescan_trigger(changes_rx, catalog, scan_tx));

        changes_tx
            .send(RuleChange { name: "edited.yar".to_string(), kind: RuleChangeKind::Modified })
            .await
            .unwrap();

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(scan_rx.recv().await.unwrap());
        }
        assert!(requests.iter().all(|request| request.cause == ScanCause::RuleChanged));
        let mut names: Vec<_> = requests.into_iter().map(|request| request.artifact).collect();
        names.sort();
        assert_eq!(names, ["a.bin", "b.bin", "c.bin"]);

        // Closing the change stream ends the trigger, which releases its
        // scan sender.
        drop(changes_tx);
        trigger.await.unwrap();
        assert!(scan_rx.recv().await.is_none());
        db.close().await;
    }

    #[tokio::test]
    async fn test_rescan_with_empty_catalog_emits_nothing() {
        let db = Database::connect_in_memory().await.unwrap();
        let (changes_tx, changes_rx) = mpsc::channel(4);
        let (scan_tx, mut scan_rx) = mpsc::channel(16);
        let trigger = tokio::spawn(rescan_trigger(changes_rx, Repository::from(&db), scan_tx));

        changes_tx
            .send(RuleChange { name: "edited.yar".to_string(), kind: RuleChangeKind::Modified })
            .await
            .unwrap();
        drop(changes_tx);
        trigger.await.unwrap();
        assert!(scan_rx.recv().await.is_none());
        db.close().await;
    }
}
