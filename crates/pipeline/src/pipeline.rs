//! Pipeline lifecycle: construction, startup order, drain order.

use crate::error::{ErrorKind, Result};
use crate::ignore::IgnoreTracker;
use crate::persist::result_persister;
use crate::scan::{RESULT_QUEUE_CAPACITY, SCAN_QUEUE_CAPACITY, ScanRequest, rescan_trigger, scan_worker};
use crate::sync::{ObjectSyncer, PARTIAL_SUFFIX};
use crate::watch::{DirWatcher, artifact_bridge, rule_bridge, watch_dir};
use exn::OptionExt;
use quarry_catalog::Repository;
use quarry_rules::{ProviderHandle, RuleChange, RulesetProvider, WatchedRulesetProvider};
use quarry_store::StoreHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Capacity of the raw rule-change channel into the provider.
const RULE_EVENT_CAPACITY: usize = 1000;

/// Plain-value configuration for the pipeline core.
///
/// Everything here is resolved (env, CLI, config file) before construction;
/// the core never reads configuration sources itself.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory artifacts are downloaded into and scanned from.
    pub artifact_dir: PathBuf,
    /// Directory of rule sources.
    pub rule_dir: PathBuf,
    /// Size of both the download and scan worker pools.
    pub workers: usize,
    /// Budget for a single scan; a stuck scan is abandoned after this.
    pub scan_timeout: Duration,
    /// How often the bucket is listed for new objects.
    pub list_interval: Duration,
    /// How often the artifact directory is re-read into the ignore set.
    pub refresh_interval: Duration,
}

impl PipelineConfig {
    /// Config with production defaults for everything but the directories.
    pub fn new(artifact_dir: impl Into<PathBuf>, rule_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            rule_dir: rule_dir.into(),
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            scan_timeout: Duration::from_secs(5),
            list_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Draining,
    Stopped,
}

/// The whole pipeline under one lifecycle.
///
/// `new` performs every construction-time validation (directories exist,
/// watches establish, provider constructs); `start` brings workers up in
/// dependency order; `close` drains them in the reverse direction. Both
/// `start` and `close` are idempotent.
///
/// # Shutdown ordering
///
/// `close` never closes a channel a live producer still holds. It signals
/// the timers and watch bridges to stop, then follows the cascade:
/// the rule bridge's exit closes the provider's input, the provider's exit
/// closes the rescan trigger's input, and with the bridges and trigger gone
/// the last scan sender is dropped — the workers drain the queue, their
/// exit drops the last result sender, and the persister drains what's left.
/// Every join happens in that order, so no in-flight request or result is
/// lost.
pub struct Pipeline {
    config: PipelineConfig,
    catalog: Repository,
    ignore: Arc<IgnoreTracker>,
    provider: Arc<WatchedRulesetProvider>,
    syncer: ObjectSyncer,
    artifact_watch: Option<DirWatcher>,
    rule_watch: Option<DirWatcher>,
    /// Sender side of the provider's change input; handed to the rule
    /// bridge at start.
    rules_tx: Option<mpsc::Sender<RuleChange>>,
    /// Receiver side of the provider's forwarded changes; handed to the
    /// rescan trigger at start.
    changes_rx: Option<mpsc::Receiver<RuleChange>>,
    shutdown: watch::Sender<bool>,
    bridge_handles: Vec<JoinHandle<()>>,
    provider_handle: Option<JoinHandle<()>>,
    rescan_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    persister_handle: Option<JoinHandle<()>>,
    state: State,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Construct the pipeline. Fails fast on anything that would make the
    /// steady state impossible: missing directories, unwatchable paths.
    pub fn new(store: StoreHandle, catalog: Repository, config: PipelineConfig) -> Result<Self> {
        if !config.artifact_dir.is_dir() {
            exn::bail!(ErrorKind::MissingDirectory(config.artifact_dir));
        }
        if !config.rule_dir.is_dir() {
            exn::bail!(ErrorKind::MissingDirectory(config.rule_dir));
        }
        let artifact_watch = watch_dir(&config.artifact_dir)?;
        let rule_watch = watch_dir(&config.rule_dir)?;

        let (rules_tx, rules_rx) = mpsc::channel(RULE_EVENT_CAPACITY);
        let (provider, changes_rx) =
            WatchedRulesetProvider::new(&config.rule_dir, catalog.clone(), rules_rx)
                .map_err(|err| err.raise(ErrorKind::Rules))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ignore = Arc::new(IgnoreTracker::new());
        let syncer = ObjectSyncer::new(
            store,
            config.artifact_dir.clone(),
            Arc::clone(&ignore),
            config.list_interval,
            config.refresh_interval,
            shutdown_rx,
        )?;

        Ok(Self {
            config,
            catalog,
            ignore,
            provider: Arc::new(provider),
            syncer,
            artifact_watch: Some(artifact_watch),
            rule_watch: Some(rule_watch),
            rules_tx: Some(rules_tx),
            changes_rx: Some(changes_rx),
            shutdown,
            bridge_handles: Vec::new(),
            provider_handle: None,
            rescan_handle: None,
            worker_handles: Vec::new(),
            persister_handle: None,
            state: State::Created,
        })
    }

    /// The catalog this pipeline records into.
    pub fn catalog(&self) -> &Repository {
        &self.catalog
    }

    /// Bring everything up, in dependency order. Calling `start` on a
    /// started pipeline is a no-op; on a closed one it's an error.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            State::Created => {},
            State::Started => {
                debug!("pipeline already started");
                return Ok(());
            },
            State::Draining | State::Stopped => exn::bail!(ErrorKind::Closed),
        }

        // Catalogue what's already on disk; these get their initial scan
        // below, once the workers exist to serve it.
        let preloaded = self.load_existing().await?;

        // The initial ruleset must be live before the first worker spawns:
        // scanning without a generation is a construction failure, not a
        // runtime one.
        self.provider.load_rules().await.map_err(|err| err.raise(ErrorKind::Rules))?;

        let (scan_tx, scan_rx) = mpsc::channel::<ScanRequest>(SCAN_QUEUE_CAPACITY);
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_CAPACITY);

        // Consumers first, producers last.
        self.persister_handle =
            Some(tokio::spawn(result_persister(results_rx, self.catalog.clone())));

        let scan_rx = Arc::new(Mutex::new(scan_rx));
        let provider: ProviderHandle = self.provider.clone();
        for worker in 0..self.config.workers.max(1) {
            self.worker_handles.push(tokio::spawn(scan_worker(
                worker,
                Arc::clone(&scan_rx),
                Arc::clone(&provider),
                self.config.artifact_dir.clone(),
                self.config.scan_timeout,
                results_tx.clone(),
            )));
        }
        // The workers hold the only result senders from here on.
        drop(results_tx);

        let changes_rx = self.changes_rx.take().ok_or_raise(|| ErrorKind::Closed)?;
        self.rescan_handle = Some(tokio::spawn(rescan_trigger(
            changes_rx,
            self.catalog.clone(),
            scan_tx.clone(),
        )));

        let artifact_events = self
            .artifact_watch
            .as_mut()
            .and_then(DirWatcher::take_events)
            .ok_or_raise(|| ErrorKind::Closed)?;
        self.bridge_handles.push(tokio::spawn(artifact_bridge(
            artifact_events,
            self.catalog.clone(),
            scan_tx.clone(),
            self.shutdown.subscribe(),
        )));

        let rule_events = self
            .rule_watch
            .as_mut()
            .and_then(DirWatcher::take_events)
            .ok_or_raise(|| ErrorKind::Closed)?;
        let rules_tx = self.rules_tx.take().ok_or_raise(|| ErrorKind::Closed)?;
        self.bridge_handles.push(tokio::spawn(rule_bridge(
            rule_events,
            rules_tx,
            self.shutdown.subscribe(),
        )));

        self.provider_handle = Some(tokio::spawn(Arc::clone(&self.provider).run()));

        // Initial new-arrival pass over everything that was already local.
        for name in preloaded {
            if scan_tx.send(ScanRequest::new_arrival(name)).await.is_err() {
                break;
            }
        }
        // From here the bridges and the rescan trigger are the only scan
        // producers; when they go, the queue closes.
        drop(scan_tx);

        self.syncer.start(self.config.workers);

        self.state = State::Started;
        info!(workers = self.config.workers, "pipeline started");
        Ok(())
    }

    /// Catalogue every artifact already present locally.
    ///
    /// They are also marked in the ignore set up front so the very first
    /// listing pass doesn't re-download them.
    async fn load_existing(&self) -> Result<Vec<String>> {
        let mut entries =
            tokio::fs::read_dir(&self.config.artifact_dir).await.map_err(ErrorKind::Io)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
            let file_type = entry.file_type().await.map_err(ErrorKind::Io)?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) || name.starts_with('.') {
                continue;
            }
            self.catalog
                .upsert_artifact(&name)
                .await
                .map_err(|err| err.raise(ErrorKind::Catalog))?;
            self.ignore.mark(&name).await;
            names.push(name);
        }
        info!(artifacts = names.len(), "catalogued pre-existing artifacts");
        Ok(names)
    }

    /// Stop producers, drain consumers, release watches — in that order.
    pub async fn close(&mut self) {
        match self.state {
            State::Started => {},
            State::Created => {
                self.state = State::Stopped;
                return;
            },
            State::Draining | State::Stopped => {
                debug!("pipeline already closed");
                return;
            },
        }
        self.state = State::Draining;
        info!("pipeline draining");

        // 1. Stop input production: the timers and both watch bridges all
        //    watch this signal.
        let _ = self.shutdown.send(true);

        // 2. The list loop exits and its queue closure drains the download
        //    workers.
        self.syncer.close().await;

        // 3. Bridges observe the signal and drop their senders.
        for handle in self.bridge_handles.drain(..) {
            Self::join("watch bridge", handle).await;
        }

        // 4. With the rule bridge gone the provider's input is closed; its
        //    exit releases the rescan channel.
        if let Some(handle) = self.provider_handle.take() {
            Self::join("ruleset provider", handle).await;
        }
        self.provider.stop().await;

        // 5. The rescan trigger drains out and drops the last scan sender.
        if let Some(handle) = self.rescan_handle.take() {
            Self::join("rescan trigger", handle).await;
        }

        // 6. Scan workers drain the request queue, then release the result
        //    channel.
        for handle in self.worker_handles.drain(..) {
            Self::join("scan worker", handle).await;
        }

        // 7. The persister drains whatever the workers produced.
        if let Some(handle) = self.persister_handle.take() {
            Self::join("result persister", handle).await;
        }

        // 8. Release the OS watch handles last; nothing consumes their
        //    events anymore.
        self.artifact_watch.take();
        self.rule_watch.take();

        self.state = State::Stopped;
        info!("pipeline stopped");
    }

    async fn join(who: &str, handle: JoinHandle<()>) {
        if let Err(err) = handle.await {
            error!("{who} panicked: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_catalog::Database;
    use quarry_store::backend::MockStore;

    async fn fixture() -> (tempfile::TempDir, tempfile::TempDir, Database, Pipeline) {
        let artifact_dir = tempfile::tempdir().unwrap();
        let rule_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            rule_dir.path().join("mark.yar"),
            r#"rule mark { strings: $a = "MARK" condition: $a }"#,
        )
        .unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let pipeline = Pipeline::new(
            Arc::new(MockStore::default()),
            Repository::from(&db),
            PipelineConfig::new(artifact_dir.path(), rule_dir.path()),
        )
        .unwrap();
        (artifact_dir, rule_dir, db, pipeline)
    }

    #[tokio::test]
    async fn test_missing_artifact_dir_is_construction_error() {
        let rule_dir = tempfile::tempdir().unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let err = Pipeline::new(
            Arc::new(MockStore::default()),
            Repository::from(&db),
            PipelineConfig::new("/nonexistent/artifacts", rule_dir.path()),
        )
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::MissingDirectory(_)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_close_without_start() {
        let (_bins, _rules, db, mut pipeline) = fixture().await;
        pipeline.close().await;
        // And again; terminal states are sticky.
        pipeline.close().await;
        db.close().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_close_drains() {
        let (_bins, _rules, db, mut pipeline) = fixture().await;
        pipeline.start().await.unwrap();
        pipeline.start().await.unwrap();
        pipeline.close().await;
        db.close().await;
    }

    #[tokio::test]
    async fn test_start_after_close_is_an_error() {
        let (_bins, _rules, db, mut pipeline) = fixture().await;
        pipeline.close().await;
        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        db.close().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_broken_initial_ruleset() {
        let artifact_dir = tempfile::tempdir().unwrap();
        let rule_dir = tempfile::tempdir().unwrap();
        std::fs::write(rule_dir.path().join("broken.yar"), "rule nope {").unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let mut pipeline = Pipeline::new(
            Arc::new(MockStore::default()),
            Repository::from(&db),
            PipelineConfig::new(artifact_dir.path(), rule_dir.path()),
        )
        .unwrap();
        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Rules));
        db.close().await;
    }
}
