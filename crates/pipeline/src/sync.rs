//! Pulling bucket objects down to the artifact directory.
//!
//! Three kinds of workers cooperate here:
//! - a list loop that periodically diffs the bucket against the
//!   [`IgnoreTracker`] and enqueues unseen names,
//! - N download workers draining the bounded queue, and
//! - a refresh loop that re-reads the artifact directory so pre-seeded
//!   files are never fetched again.
//!
//! The queue is the backpressure point: if downloads fall behind, the list
//! loop blocks on `send` instead of buffering the bucket into memory.

use crate::error::{ErrorKind, Result};
use crate::ignore::IgnoreTracker;
use futures::StreamExt;
use quarry_store::{ObjectStore, StoreHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Download queue capacity; a full queue blocks the list loop.
pub(crate) const DOWNLOAD_QUEUE_CAPACITY: usize = 10_000;
/// Suffix for in-progress downloads; renamed away once the bytes are on disk.
pub(crate) const PARTIAL_SUFFIX: &str = ".part";

/// Periodically syncs a bucket into a local directory.
///
/// `start` spawns the workers; the shutdown signal passed at construction
/// stops the two timer loops, and the queue closing behind them drains the
/// download workers. [`close`](Self::close) then waits for all of it.
pub struct ObjectSyncer {
    store: StoreHandle,
    artifact_dir: PathBuf,
    ignore: Arc<IgnoreTracker>,
    list_interval: Duration,
    refresh_interval: Duration,
    shutdown: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl std::fmt::Debug for ObjectSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectSyncer").finish_non_exhaustive()
    }
}

impl ObjectSyncer {
    /// Create a syncer. The artifact directory must already exist.
    pub fn new(
        store: StoreHandle,
        artifact_dir: impl Into<PathBuf>,
        ignore: Arc<IgnoreTracker>,
        list_interval: Duration,
        refresh_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let artifact_dir = artifact_dir.into();
        if !artifact_dir.is_dir() {
            exn::bail!(ErrorKind::MissingDirectory(artifact_dir));
        }
        Ok(Self {
            store,
            artifact_dir,
            ignore,
            list_interval,
            refresh_interval,
            shutdown,
            handles: Vec::new(),
            started: false,
        })
    }

    /// Spawn the download workers and both timer loops. Idempotent.
    pub fn start(&mut self, workers: usize) {
        if self.started {
            debug!("syncer already started");
            return;
        }
        let (queue_tx, queue_rx) = mpsc::channel::<String>(DOWNLOAD_QUEUE_CAPACITY);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker in 0..workers.max(1) {
            self.handles.push(tokio::spawn(download_worker(
                worker,
                Arc::clone(&queue_rx),
                Arc::clone(&self.store),
                self.artifact_dir.clone(),
                Arc::clone(&self.ignore),
            )));
        }
        self.handles.push(tokio::spawn(list_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.ignore),
            queue_tx,
            self.list_interval,
            self.shutdown.clone(),
        )));
        self.handles.push(tokio::spawn(refresh_loop(
            Arc::clone(&self.ignore),
            self.artifact_dir.clone(),
            self.refresh_interval,
            self.shutdown.clone(),
        )));
        self.started = true;
        info!(store = self.store.name(), "object sync started");
    }

    /// Wait for every sync worker to exit.
    ///
    /// The shutdown signal must already have been sent; this only joins.
    /// The list loop exits on the signal and drops the queue sender, which
    /// drains and releases the download workers.
    pub async fn close(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!("sync worker panicked: {err}");
            }
        }
        debug!("syncer: all workers done");
    }
}

/// One listing pass: enqueue every bucket object not yet known locally.
///
/// Returns how many names were enqueued. Unlistable entries are reported
/// and skipped; they must not hide the rest of the listing.
pub(crate) async fn list_once(
    store: &StoreHandle,
    ignore: &IgnoreTracker,
    queue: &mpsc::Sender<String>,
) -> Result<usize> {
    let mut stream = store.list_stream();
    let mut enqueued = 0;
    while let Some(object) = stream.next().await {
        let object = match object {
            Ok(object) => object,
            Err(err) => {
                warn!("skipping unlistable object: {err}");
                continue;
            },
        };
        if ignore.is_ignored(&object.key).await {
            continue;
        }
        // Blocking send: the queue is the backpressure point.
        if queue.send(object.key).await.is_err() {
            // Queue closed mid-listing: shutdown is in progress.
            break;
        }
        enqueued += 1;
    }
    Ok(enqueued)
}

async fn list_loop(
    store: StoreHandle,
    ignore: Arc<IgnoreTracker>,
    queue: mpsc::Sender<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match list_once(&store, &ignore, &queue).await {
                    Ok(0) => {},
                    Ok(enqueued) => debug!(enqueued, "bucket listing pass complete"),
                    Err(err) => error!("bucket listing failed: {err}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("list worker exiting");
    // Dropping `queue` here closes the download queue; workers drain it and
    // exit.
}

async fn download_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    store: StoreHandle,
    artifact_dir: PathBuf,
    ignore: Arc<IgnoreTracker>,
) {
    loop {
        // Hold the lock only while waiting for one item so siblings can
        // take the next one while this worker downloads.
        let key = { queue.lock().await.recv().await };
        let Some(key) = key else { break };
        // Re-check: the listing that enqueued this may have raced a refresh.
        if ignore.is_ignored(&key).await {
            continue;
        }
        match download_one(&store, &artifact_dir, &key).await {
            Ok(size) => {
                ignore.mark(&key).await;
                info!(worker, key = %key, size, "downloaded artifact");
            },
            Err(err) => warn!(worker, key = %key, "download failed: {err}"),
        }
    }
    debug!(worker, "download worker exiting");
}

/// Fetch one object and materialize it atomically.
///
/// The bytes land in a `.part` temp first and are renamed into place, so
/// the directory watch and the refresher only ever see complete artifacts.
pub(crate) async fn download_one(store: &StoreHandle, artifact_dir: &Path, key: &str) -> Result<u64> {
    let data = store.fetch(key).await.map_err(|err| err.raise(ErrorKind::Store))?;
    let partial_path = artifact_dir.join(format!("{key}{PARTIAL_SUFFIX}"));
    let final_path = artifact_dir.join(key);
    fs::write(&partial_path, &data).await.map_err(ErrorKind::Io)?;
    fs::rename(&partial_path, &final_path).await.map_err(ErrorKind::Io)?;
    Ok(data.len() as u64)
}

async fn refresh_loop(
    ignore: Arc<IgnoreTracker>,
    artifact_dir: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ignore.refresh_from(&artifact_dir).await {
                    Ok(0) => {},
                    Ok(marked) => debug!(marked, "ignore set refreshed"),
                    Err(err) => error!("ignore refresh failed: {err}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("refresh worker exiting");
}
