//! Ruleset providers: who owns the compiled rules and when they change.
//!
//! Scan workers only ever see a [`RulesetSnapshot`]: one complete compiled
//! generation behind an `Arc`. The provider swaps the authoritative snapshot
//! under an exclusive lock; a reader gets either the old generation in full
//! or the new one in full, never a mix, and holds whatever it got for the
//! duration of its scan regardless of later swaps.

use crate::engine::{self, RuleMatch};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::OptionExt;
use quarry_catalog::Repository;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::UtcDateTime;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, warn};

/// Capacity of the downstream rule-change channel (rescan triggers).
const RULE_CHANGE_CAPACITY: usize = 1000;

/// What happened to a rule source on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChangeKind {
    Added,
    Modified,
    Removed,
}

/// A change to one rule source, as observed by the filesystem watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChange {
    /// File name of the rule source within the rule directory.
    pub name: String,
    pub kind: RuleChangeKind,
}

/// One immutable compiled generation of the full rule collection.
pub struct RulesetSnapshot {
    generation: u64,
    source_count: usize,
    built_at: UtcDateTime,
    compiled: yara_x::Rules,
}
impl RulesetSnapshot {
    /// Monotonic generation id; each publish increments it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of rule sources compiled into this generation.
    pub fn source_count(&self) -> usize {
        self.source_count
    }

    pub fn built_at(&self) -> UtcDateTime {
        self.built_at
    }

    /// Scan one artifact file against this generation within `timeout`.
    ///
    /// CPU-bound; callers on an async runtime should wrap this in
    /// `spawn_blocking`.
    pub fn scan(&self, path: &Path, timeout: Duration) -> Result<Vec<RuleMatch>> {
        engine::scan_artifact(&self.compiled, path, timeout)
    }
}
impl std::fmt::Debug for RulesetSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RulesetSnapshot")
            .field("generation", &self.generation)
            .field("source_count", &self.source_count)
            .field("built_at", &self.built_at)
            .finish_non_exhaustive()
    }
}

/// Any source of compiled rulesets.
///
/// Kept as a capability so an alternative provider (say, rules fetched from
/// a remote registry) can slot in without touching the scan workers.
#[async_trait]
pub trait RulesetProvider: Send + Sync {
    /// Load every rule source and publish the initial generation.
    ///
    /// A failure here is a construction-time failure: the pipeline must not
    /// start scanning without a valid initial ruleset.
    async fn load_rules(&self) -> Result<()>;

    /// The current authoritative snapshot.
    ///
    /// Returns [`NotLoaded`](crate::error::ErrorKind::NotLoaded) before the
    /// initial [`load_rules`](Self::load_rules) has published a generation.
    async fn get_rules(&self) -> Result<Arc<RulesetSnapshot>>;

    /// Consume incoming rule changes until the change source closes.
    async fn run(self: Arc<Self>);

    /// Close the downstream change channel.
    async fn stop(&self);
}

pub type ProviderHandle = Arc<dyn RulesetProvider>;

/// A [`RulesetProvider`] that recompiles as rule files change.
///
/// Incoming changes are forwarded downstream *before* recompilation, so a
/// full rescan is scheduled for every edit — including one that fails to
/// compile or removes a rule: the artifact catalog must be re-evaluated
/// against whatever generation is authoritative afterwards.
///
/// A failed incremental compile is reported and discarded; the last valid
/// generation (and its source set) stays authoritative until a corrected
/// update arrives.
pub struct WatchedRulesetProvider {
    rule_dir: PathBuf,
    catalog: Repository,
    /// Rule source texts by file name; the single input to a rebuild.
    sources: Mutex<BTreeMap<String, String>>,
    /// The authoritative snapshot. Writers swap the Arc; readers clone it.
    current: RwLock<Option<Arc<RulesetSnapshot>>>,
    generation: AtomicU64,
    incoming: Mutex<Option<mpsc::Receiver<RuleChange>>>,
    outgoing: Mutex<Option<mpsc::Sender<RuleChange>>>,
}

impl std::fmt::Debug for WatchedRulesetProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedRulesetProvider").finish_non_exhaustive()
    }
}

impl WatchedRulesetProvider {
    /// Construct a provider watching `rule_dir`, fed by `incoming` change
    /// events.
    ///
    /// Returns the provider and the downstream change receiver that rescan
    /// scheduling consumes. Fails if the rule directory does not exist.
    pub fn new(
        rule_dir: impl Into<PathBuf>,
        catalog: Repository,
        incoming: mpsc::Receiver<RuleChange>,
    ) -> Result<(Self, mpsc::Receiver<RuleChange>)> {
        let rule_dir = rule_dir.into();
        if !rule_dir.is_dir() {
            exn::bail!(ErrorKind::RuleDirMissing(rule_dir));
        }
        let (outgoing_tx, outgoing_rx) = mpsc::channel(RULE_CHANGE_CAPACITY);
        let provider = Self {
            rule_dir,
            catalog,
            sources: Mutex::new(BTreeMap::new()),
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            incoming: Mutex::new(Some(incoming)),
            outgoing: Mutex::new(Some(outgoing_tx)),
        };
        Ok((provider, outgoing_rx))
    }

    /// Compile `sources` and swap the result in as the new generation.
    ///
    /// Compilation happens outside the snapshot lock; the write lock is held
    /// only for the pointer swap, so concurrent readers stall for the swap
    /// and nothing more.
    async fn publish(&self, sources: &BTreeMap<String, String>) -> Result<Arc<RulesetSnapshot>> {
        let compiled =
            engine::build_ruleset(sources.iter().map(|(name, text)| (name.as_str(), text.as_str())))?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(RulesetSnapshot {
            generation,
            source_count: sources.len(),
            built_at: UtcDateTime::now(),
            compiled,
        });
        *self.current.write().await = Some(Arc::clone(&snapshot));
        debug!(generation, sources = sources.len(), "published ruleset generation");
        Ok(snapshot)
    }

    /// Apply one change to a candidate source set and publish it.
    ///
    /// The live source map is only committed once the candidate compiled,
    /// so a broken edit can't poison later rebuilds.
    async fn apply(&self, change: &RuleChange) -> Result<()> {
        let mut sources = self.sources.lock().await;
        let mut candidate = sources.clone();
        match change.kind {
            RuleChangeKind::Removed => {
                candidate.remove(&change.name);
            },
            RuleChangeKind::Added | RuleChangeKind::Modified => {
                let path = self.rule_dir.join(&change.name);
                let text = tokio::fs::read_to_string(&path).await.map_err(ErrorKind::Io)?;
                candidate.insert(change.name.clone(), text);
            },
        }
        self.publish(&candidate).await?;
        *sources = candidate;
        if change.kind != RuleChangeKind::Removed {
            self.record_rule(&change.name).await;
        }
        Ok(())
    }

    /// Bookkeeping only; a catalog hiccup must not reject a valid ruleset.
    async fn record_rule(&self, name: &str) {
        if let Err(err) = self.catalog.record_rule(name).await {
            warn!(rule = %name, "failed to record rule source in catalog: {err}");
        }
    }
}

#[async_trait]
impl RulesetProvider for WatchedRulesetProvider {
    async fn load_rules(&self) -> Result<()> {
        let mut sources = self.sources.lock().await;
        let mut loaded = BTreeMap::new();
        let mut dir = tokio::fs::read_dir(&self.rule_dir).await.map_err(ErrorKind::Io)?;
        while let Some(entry) = dir.next_entry().await.map_err(ErrorKind::Io)? {
            let file_type = entry.file_type().await.map_err(ErrorKind::Io)?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "skipping rule file with non-UTF8 name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let text = tokio::fs::read_to_string(entry.path()).await.map_err(ErrorKind::Io)?;
            loaded.insert(name, text);
        }
        let snapshot = self.publish(&loaded).await?;
        for name in loaded.keys() {
            self.record_rule(name).await;
        }
        *sources = loaded;
        tracing::info!(
            generation = snapshot.generation(),
            sources = snapshot.source_count(),
            "initial ruleset loaded"
        );
        Ok(())
    }

    async fn get_rules(&self) -> Result<Arc<RulesetSnapshot>> {
        self.current.read().await.clone().ok_or_raise(|| ErrorKind::NotLoaded)
    }

    async fn run(self: Arc<Self>) {
        let Some(mut incoming) = self.incoming.lock().await.take() else {
            warn!("ruleset provider run() called twice; ignoring");
            return;
        };
        while let Some(change) = incoming.recv().await {
            debug!(rule = %change.name, kind = ?change.kind, "rule change observed");
            // Forward before compiling: a rescan is due for every edit, even
            // one that fails to compile.
            if let Some(outgoing) = self.outgoing.lock().await.as_ref()
                && outgoing.send(change.clone()).await.is_err()
            {
                debug!("rescan channel closed; rule changes no longer forwarded");
            }
            if let Err(err) = self.apply(&change).await {
                error!(
                    rule = %change.name,
                    "rule update rejected; keeping last valid generation: {err}"
                );
            }
        }
        debug!("ruleset provider exiting");
        // Input is gone for good; release the downstream channel so the
        // rescan listener can drain out too.
        self.stop().await;
    }

    async fn stop(&self) {
        self.outgoing.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_catalog::Database;

    const MARK_RULE: &str = r#"
rule mark {
    meta:
        score = 10
    strings:
        $a = "MARK"
    condition:
        $a
}
"#;

    async fn fixture(
        rule_files: &[(&str, &str)],
    ) -> (tempfile::TempDir, Database, Arc<WatchedRulesetProvider>, mpsc::Sender<RuleChange>, mpsc::Receiver<RuleChange>) {
        let dir = tempfile::tempdir().unwrap();
        for (name, text) in rule_files {
            std::fs::write(dir.path().join(name), text).unwrap();
        }
        let db = Database::connect_in_memory().await.unwrap();
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (provider, outgoing_rx) =
            WatchedRulesetProvider::new(dir.path(), Repository::from(&db), incoming_rx).unwrap();
        (dir, db, Arc::new(provider), incoming_tx, outgoing_rx)
    }

    async fn wait_for_generation(
        provider: &WatchedRulesetProvider,
        generation: u64,
    ) -> Arc<RulesetSnapshot> {
        for _ in 0..200 {
            if let Ok(snapshot) = provider.get_rules().await
                && snapshot.generation() >= generation
            {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation {generation} never published");
    }

    #[tokio::test]
    async fn test_get_rules_before_load_is_not_loaded() {
        let (_dir, db, provider, _tx, _rx) = fixture(&[]).await;
        let err = provider.get_rules().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotLoaded));
        db.close().await;
    }

    #[tokio::test]
    async fn test_missing_rule_dir_is_construction_error() {
        let db = Database::connect_in_memory().await.unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let err = WatchedRulesetProvider::new("/nonexistent/rules", Repository::from(&db), rx)
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::RuleDirMissing(_)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_initial_load_publishes_generation_one() {
        let (_dir, db, provider, _tx, _rx) = fixture(&[("mark.yar", MARK_RULE)]).await;
        provider.load_rules().await.unwrap();
        let snapshot = provider.get_rules().await.unwrap();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.source_count(), 1);
        // Loaded sources are recorded for bookkeeping.
        let rules = Repository::from(&db).rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "mark.yar");
        db.close().await;
    }

    #[tokio::test]
    async fn test_initial_load_failure_is_fatal() {
        let (_dir, db, provider, _tx, _rx) = fixture(&[("broken.yar", "rule nope {")]).await;
        let err = provider.load_rules().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Compile(_)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_change_is_forwarded_and_published() {
        let (dir, db, provider, tx, mut rx) = fixture(&[("mark.yar", MARK_RULE)]).await;
        provider.load_rules().await.unwrap();
        let before = provider.get_rules().await.unwrap();
        let run = tokio::spawn(Arc::clone(&provider).run());

        std::fs::write(
            dir.path().join("extra.yar"),
            r#"rule extra { strings: $b = "EXTRA" condition: $b }"#,
        )
        .unwrap();
        tx.send(RuleChange { name: "extra.yar".to_string(), kind: RuleChangeKind::Added })
            .await
            .unwrap();

        // Forwarded downstream (before or independent of the rebuild).
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.name, "extra.yar");

        let after = wait_for_generation(&provider, 2).await;
        assert_eq!(after.generation(), 2);
        assert_eq!(after.source_count(), 2);
        // The previously published generation is untouched.
        assert_eq!(before.generation(), 1);
        assert_eq!(before.source_count(), 1);

        drop(tx);
        run.await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_bad_update_keeps_last_valid_generation() {
        let (dir, db, provider, tx, mut rx) = fixture(&[("mark.yar", MARK_RULE)]).await;
        provider.load_rules().await.unwrap();
        let run = tokio::spawn(Arc::clone(&provider).run());

        // A broken edit: forwarded downstream, but never published.
        std::fs::write(dir.path().join("broken.yar"), "rule nope {").unwrap();
        tx.send(RuleChange { name: "broken.yar".to_string(), kind: RuleChangeKind::Added })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "broken.yar");

        // A later good edit still goes through: the broken source wasn't
        // committed to the live source set.
        std::fs::write(
            dir.path().join("good.yar"),
            r#"rule good { strings: $c = "GOOD" condition: $c }"#,
        )
        .unwrap();
        tx.send(RuleChange { name: "good.yar".to_string(), kind: RuleChangeKind::Added })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "good.yar");

        let snapshot = wait_for_generation(&provider, 2).await;
        // Exactly one publish happened after the initial load.
        assert_eq!(snapshot.generation(), 2);
        // mark.yar + good.yar; broken.yar was discarded.
        assert_eq!(snapshot.source_count(), 2);

        drop(tx);
        run.await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_removal_publishes_without_the_source() {
        let (dir, db, provider, tx, mut rx) = fixture(&[
            ("mark.yar", MARK_RULE),
            ("other.yar", r#"rule other { condition: false }"#),
        ])
        .await;
        provider.load_rules().await.unwrap();
        let run = tokio::spawn(Arc::clone(&provider).run());

        std::fs::remove_file(dir.path().join("other.yar")).unwrap();
        tx.send(RuleChange { name: "other.yar".to_string(), kind: RuleChangeKind::Removed })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, RuleChangeKind::Removed);

        let snapshot = wait_for_generation(&provider, 2).await;
        assert_eq!(snapshot.source_count(), 1);

        drop(tx);
        run.await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_run_exit_closes_downstream_channel() {
        let (_dir, db, provider, tx, mut rx) = fixture(&[("mark.yar", MARK_RULE)]).await;
        provider.load_rules().await.unwrap();
        let run = tokio::spawn(Arc::clone(&provider).run());
        drop(tx);
        run.await.unwrap();
        // Downstream consumers observe closure and can drain out.
        assert!(rx.recv().await.is_none());
        db.close().await;
    }
}
