use std::fs::OpenOptions;
use std::io::Write;

use docket_core::{CheckpointStore, Metadata, RunConfig, UnitStatus};
use tokio_util::sync::CancellationToken;

use crate::common::{ListEnumerator, Quiet, StagingProcessor, checkpoint, coordinator};

#[tokio::test]
async fn crash_mid_append_resumes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("checkpoint.csv");
    let processor = StagingProcessor::new(&dir.path().join("work"));
    let c = coordinator(processor.clone(), &dir.path().join("bucket"), RunConfig::default());

    c.run(
        &ListEnumerator::ids(&["a", "b"]),
        &checkpoint(dir.path()),
        CancellationToken::new(),
        &Quiet,
    )
    .await
    .unwrap();

    // Simulate a process killed halfway through writing the record for "c".
    let mut log = OpenOptions::new().append(true).open(&path).unwrap();
    log.write_all(b"c,success,,{\"artifact_k").unwrap();
    drop(log);

    let store = checkpoint(dir.path());
    assert!(store.is_done("a"));
    assert!(!store.is_done("c"));

    let summary = c
        .run(&ListEnumerator::ids(&["a", "b", "c"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!((summary.skipped, summary.succeeded), (2, 1));

    let loaded = CheckpointStore::load(&path).unwrap();
    assert_eq!(loaded.len(), 3);
    assert!(loaded.values().all(|r| r.status == UnitStatus::Success));
}

#[test]
fn record_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.csv");

    let store = CheckpointStore::open(&path).unwrap();
    let mut meta = Metadata::new();
    meta.insert("artifact_key".into(), "filings/a.pdf".into());
    store.record("a", UnitStatus::Success, None, meta).unwrap();
    store
        .record("b", UnitStatus::Failed, Some("HTTP 404 for https://x/b.pdf"), Metadata::new())
        .unwrap();
    drop(store);

    let reopened = CheckpointStore::open(&path).unwrap();
    assert!(reopened.is_done("a"));
    assert!(reopened.is_done("b"));
    let counts = reopened.counts();
    assert_eq!((counts.success, counts.failed, counts.pending), (1, 1, 0));
}

#[test]
fn concurrent_appends_keep_every_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.csv");
    let store = CheckpointStore::open(&path).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    store
                        .record(&format!("t{t}-{i}"), UnitStatus::Success, None, Metadata::new())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(CheckpointStore::load(&path).unwrap().len(), 200);
}

#[test]
fn reset_all_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.csv");
    let store = CheckpointStore::open(&path).unwrap();
    store.record("a", UnitStatus::Success, None, Metadata::new()).unwrap();
    drop(store);

    let backup = CheckpointStore::reset_all(&path).unwrap().unwrap();
    assert!(backup.file_name().unwrap().to_string_lossy().ends_with(".bak"));
    assert_eq!(CheckpointStore::load(&backup).unwrap().len(), 1);
    assert!(!CheckpointStore::open(&path).unwrap().is_done("a"));
}
