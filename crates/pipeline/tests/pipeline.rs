//! End-to-end pipeline behavior against a mock bucket, real directories,
//! a real filesystem watch, and a real (file-backed) catalog.

use quarry_catalog::{Database, Repository};
use quarry_pipeline::{Pipeline, PipelineConfig};
use quarry_store::StoreHandle;
use quarry_store::backend::MockStore;
use std::sync::Arc;
use std::time::Duration;

const EICAR_RULE: &str = r#"
rule eicar_test {
    meta:
        score = 100
    strings:
        $marker = "EICAR"
    condition:
        $marker
}
"#;

const MARK_RULE: &str = r#"rule mark { strings: $a = "MARK" condition: $a }"#;

struct Fixture {
    artifact_dir: tempfile::TempDir,
    rule_dir: tempfile::TempDir,
    _db_dir: tempfile::TempDir,
    database: Database,
    catalog: Repository,
}

async fn fixture(rule_files: &[(&str, &str)]) -> Fixture {
    let artifact_dir = tempfile::tempdir().unwrap();
    let rule_dir = tempfile::tempdir().unwrap();
    for (name, text) in rule_files {
        std::fs::write(rule_dir.path().join(name), text).unwrap();
    }
    let db_dir = tempfile::tempdir().unwrap();
    let database = Database::connect(db_dir.path().join("catalog.db")).await.unwrap();
    let catalog = Repository::from(&database);
    Fixture { artifact_dir, rule_dir, _db_dir: db_dir, database, catalog }
}

fn config(fixture: &Fixture) -> PipelineConfig {
    let mut config = PipelineConfig::new(fixture.artifact_dir.path(), fixture.rule_dir.path());
    config.workers = 2;
    config.list_interval = Duration::from_millis(50);
    config.refresh_interval = Duration::from_millis(50);
    config
}

/// The end-to-end scenario: one object in the bucket, one rule matching
/// its contents, one durable row out the other end.
#[tokio::test(flavor = "multi_thread")]
async fn eicar_object_in_bucket_becomes_exactly_one_result_row() {
    let fixture = fixture(&[("eicar.yar", EICAR_RULE)]).await;
    let store: StoreHandle = Arc::new(MockStore::with_objects([(
        "sample.bin",
        b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*".to_vec(),
    )]));

    let mut pipeline =
        Pipeline::new(store, fixture.catalog.clone(), config(&fixture)).unwrap();
    pipeline.start().await.unwrap();

    let mut rows = Vec::new();
    for _ in 0..300 {
        rows = fixture.catalog.detections_for("sample.bin").await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pipeline.close().await;

    assert_eq!(rows.len(), 1, "expected exactly one detection row, got {rows:?}");
    assert_eq!(rows[0].artifact, "sample.bin");
    assert_eq!(rows[0].rule, "eicar_test");
    assert_eq!(rows[0].namespace, "eicar");
    assert_eq!(rows[0].score, 100);

    // The artifact was catalogued, and the synced file is on disk.
    assert!(fixture.catalog.get_artifact("sample.bin").await.unwrap().is_some());
    assert!(fixture.artifact_dir.path().join("sample.bin").exists());

    fixture.database.close().await;
}

/// Close right after start: every request enqueued by the initial
/// directory pass must still produce its row before the persister exits.
#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_drains_pending_scans() {
    const PENDING: usize = 20;
    let fixture = fixture(&[("mark.yar", MARK_RULE)]).await;
    for i in 0..PENDING {
        std::fs::write(
            fixture.artifact_dir.path().join(format!("seeded-{i:02}.bin")),
            format!("file {i} carries the MARK of the beast"),
        )
        .unwrap();
    }

    let store: StoreHandle = Arc::new(MockStore::default());
    let mut pipeline =
        Pipeline::new(store, fixture.catalog.clone(), config(&fixture)).unwrap();
    pipeline.start().await.unwrap();
    // No settling time on purpose: close must drain, not discard.
    pipeline.close().await;

    assert_eq!(fixture.catalog.detection_count().await.unwrap(), PENDING as i64);
    assert_eq!(fixture.catalog.artifact_names().await.unwrap().len(), PENDING);
    fixture.database.close().await;
}

/// Pre-existing artifacts are never re-downloaded: a stable ignore set
/// means a listing pass enqueues nothing for them.
#[tokio::test(flavor = "multi_thread")]
async fn preseeded_artifacts_are_not_downloaded_again() {
    let fixture = fixture(&[("mark.yar", MARK_RULE)]).await;
    std::fs::write(fixture.artifact_dir.path().join("seeded.bin"), b"original contents").unwrap();

    // The bucket claims a different version of the same name.
    let store: StoreHandle =
        Arc::new(MockStore::with_objects([("seeded.bin", b"remote contents".to_vec())]));
    let mut pipeline =
        Pipeline::new(store, fixture.catalog.clone(), config(&fixture)).unwrap();
    pipeline.start().await.unwrap();

    // Several listing intervals' worth of opportunity to misbehave.
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.close().await;

    let contents = std::fs::read(fixture.artifact_dir.path().join("seeded.bin")).unwrap();
    assert_eq!(contents, b"original contents");
    fixture.database.close().await;
}

/// Editing a rule while the pipeline runs re-evaluates the whole catalog
/// against the new generation.
#[tokio::test(flavor = "multi_thread")]
async fn rule_edit_triggers_rescan_of_known_artifacts() {
    let fixture = fixture(&[("quiet.yar", r#"rule quiet { strings: $z = "ZZZZ" condition: $z }"#)])
        .await;
    for name in ["one.bin", "two.bin", "three.bin"] {
        std::fs::write(fixture.artifact_dir.path().join(name), b"all GOODSTUFF here").unwrap();
    }

    let store: StoreHandle = Arc::new(MockStore::default());
    let mut pipeline =
        Pipeline::new(store, fixture.catalog.clone(), config(&fixture)).unwrap();
    pipeline.start().await.unwrap();

    // Nothing matches the initial ruleset.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.catalog.detection_count().await.unwrap(), 0);

    // Drop in a rule that matches everything already catalogued. Re-touch
    // it until the rescan lands; an edit racing the generation swap may be
    // evaluated against the old ruleset, and the next touch covers that.
    let hot_rule = r#"rule goodstuff { meta: score = 50 strings: $g = "GOOD" condition: $g }"#;
    let mut covered = false;
    for _ in 0..50 {
        std::fs::write(fixture.rule_dir.path().join("hot.yar"), hot_rule).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut all = true;
        for name in ["one.bin", "two.bin", "three.bin"] {
            all &= !fixture.catalog.detections_for(name).await.unwrap().is_empty();
        }
        if all {
            covered = true;
            break;
        }
    }
    pipeline.close().await;

    assert!(covered, "rescan never covered the full catalog");
    for name in ["one.bin", "two.bin", "three.bin"] {
        let rows = fixture.catalog.detections_for(name).await.unwrap();
        assert!(rows.iter().any(|row| row.rule == "goodstuff" && row.score == 50));
    }
    fixture.database.close().await;
}

/// An object uploaded after startup is discovered by the periodic listing,
/// downloaded, scanned, and recorded without any restart.
#[tokio::test(flavor = "multi_thread")]
async fn late_upload_flows_through_the_whole_pipeline() {
    let fixture = fixture(&[("eicar.yar", EICAR_RULE)]).await;
    let store = Arc::new(MockStore::default());
    let handle: StoreHandle = store.clone();

    let mut pipeline = Pipeline::new(handle, fixture.catalog.clone(), config(&fixture)).unwrap();
    pipeline.start().await.unwrap();

    // Upload lands while the pipeline is already running.
    store.insert("late.bin", b"freshly uploaded EICAR sample".to_vec()).await;

    let mut rows = Vec::new();
    for _ in 0..300 {
        rows = fixture.catalog.detections_for("late.bin").await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pipeline.close().await;

    assert!(!rows.is_empty(), "late upload never produced a detection");
    assert_eq!(rows[0].rule, "eicar_test");
    fixture.database.close().await;
}
