//! The single consumer that makes scan results durable.

use crate::scan::ArtifactMatches;
use quarry_catalog::{Detection, Repository};
use time::UtcDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Drain the result channel, appending one row per match.
///
/// Runs as the only writer to the results table, so storage latency shows
/// up as backpressure on the bounded result channel rather than as write
/// contention. A failed write is reported and the loop keeps going; losing
/// one row must never take the scanning pipeline down with it.
pub(crate) async fn result_persister(mut results: mpsc::Receiver<ArtifactMatches>, catalog: Repository) {
    while let Some(batch) = results.recv().await {
        for found in &batch.matches {
            let detection = Detection {
                artifact: batch.artifact.clone(),
                rule: found.rule.clone(),
                namespace: found.namespace.clone(),
                score: found.score,
                detected_at: UtcDateTime::now(),
            };
            if let Err(err) = catalog.append_detection(&detection).await {
                error!(
                    artifact = %batch.artifact,
                    rule = %found.rule,
                    "failed to record detection: {err}"
                );
            }
        }
        if !batch.matches.is_empty() {
            info!(artifact = %batch.artifact, matches = batch.matches.len(), "recorded detections");
        }
    }
    debug!("result persister exiting");
}
