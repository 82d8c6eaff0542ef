//! Filesystem watches and the bridges that turn raw events into work.
//!
//! notify's callback runs on its own thread, so it only ever forwards raw
//! events into an unbounded channel. The async bridge tasks do the real
//! work: filter noise (temp files, hidden files, irrelevant event kinds),
//! then feed the bounded domain channels — where backpressure applies.

use crate::error::{ErrorKind, Result};
use crate::scan::ScanRequest;
use crate::sync::PARTIAL_SUFFIX;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use quarry_catalog::Repository;
use quarry_rules::{RuleChange, RuleChangeKind};
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// A directory watch plus the raw event stream it feeds.
///
/// Dropping this releases the OS watch handle.
pub(crate) struct DirWatcher {
    _watcher: RecommendedWatcher,
    events: Option<mpsc::UnboundedReceiver<Event>>,
}

impl std::fmt::Debug for DirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatcher").finish_non_exhaustive()
    }
}

impl DirWatcher {
    /// Take the raw event receiver (once, when wiring up the bridge task).
    pub(crate) fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.events.take()
    }
}

/// Start watching one directory (non-recursive) for changes.
pub(crate) fn watch_dir(dir: &Path) -> Result<DirWatcher> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            // A send failure means the bridge is gone, which only happens
            // during shutdown; the event is moot by then.
            Ok(event) => {
                let _ = raw_tx.send(event);
            },
            Err(err) => error!("filesystem watch error: {err}"),
        },
        notify::Config::default(),
    )
    .map_err(|err| ErrorKind::Watch(err.to_string()))?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|err| ErrorKind::Watch(err.to_string()))?;
    Ok(DirWatcher {
        _watcher: watcher,
        events: Some(raw_rx),
    })
}

/// File names from an event worth scanning: created or modified, not a
/// download temp, not hidden.
pub(crate) fn artifact_names(event: &Event) -> Vec<String> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {},
        _ => return Vec::new(),
    }
    event_file_names(event)
}

/// Rule changes from an event, with removals mapped through so a deleted
/// rule file still triggers a rebuild and a rescan.
pub(crate) fn rule_changes(event: &Event) -> Vec<RuleChange> {
    let kind = match event.kind {
        EventKind::Create(_) => RuleChangeKind::Added,
        EventKind::Modify(_) => RuleChangeKind::Modified,
        EventKind::Remove(_) => RuleChangeKind::Removed,
        _ => return Vec::new(),
    };
    event_file_names(event)
        .into_iter()
        .map(|name| RuleChange { name, kind })
        .collect()
}

fn event_file_names(event: &Event) -> Vec<String> {
    event
        .paths
        .iter()
        .filter_map(|path| path.file_name()?.to_str())
        .filter(|name| !name.ends_with(PARTIAL_SUFFIX) && !name.starts_with('.'))
        .map(str::to_owned)
        .collect()
}

/// Forward artifact-directory events into the scan queue as new-arrival
/// requests.
///
/// Catalogues the artifact *before* dispatching the request: the rescan
/// trigger reads the catalog, so the row has to exist by the time the first
/// scan of this artifact could race a rule change.
pub(crate) async fn artifact_bridge(
    mut events: mpsc::UnboundedReceiver<Event>,
    catalog: Repository,
    scan_tx: mpsc::Sender<ScanRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                for name in artifact_names(&event) {
                    if let Err(err) = catalog.upsert_artifact(&name).await {
                        error!(artifact = %name, "failed to catalogue artifact: {err}");
                    }
                    if scan_tx.send(ScanRequest::new_arrival(name)).await.is_err() {
                        debug!("scan queue closed; artifact watch bridge exiting");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("artifact watch bridge exiting");
}

/// Forward rule-directory events to the ruleset provider.
pub(crate) async fn rule_bridge(
    mut events: mpsc::UnboundedReceiver<Event>,
    rules_tx: mpsc::Sender<RuleChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                for change in rule_changes(&event) {
                    if rules_tx.send(change).await.is_err() {
                        debug!("ruleset provider gone; rule watch bridge exiting");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("rule watch bridge exiting");
}
