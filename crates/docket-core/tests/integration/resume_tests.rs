use docket_core::{
    ArtifactStore, CheckpointStore, FsArtifactStore, IngestError, RunConfig, UnitStatus,
};
use tokio_util::sync::CancellationToken;

use crate::common::{ListEnumerator, Quiet, StagingProcessor, checkpoint, coordinator, unit};

#[tokio::test]
async fn three_units_one_times_out_then_all_skip() {
    let dir = tempfile::tempdir().unwrap();
    let processor = StagingProcessor::new(&dir.path().join("work")).slow(&["u2"]);
    let c = coordinator(processor.clone(), &dir.path().join("bucket"), RunConfig::default());

    let store = checkpoint(dir.path());
    let first = c
        .run(&ListEnumerator::ids(&["u1", "u2", "u3"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!((first.succeeded, first.failed, first.skipped), (2, 1, 0));
    assert_eq!(processor.attempts("u2"), 3);
    let reason = store.get("u2").unwrap().error_message.unwrap();
    assert!(reason.contains("3 attempts"), "{reason}");
    drop(store);

    let store = checkpoint(dir.path());
    let second = c
        .run(&ListEnumerator::ids(&["u1", "u2", "u3"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!((second.succeeded, second.failed, second.skipped), (0, 0, 3));
    assert_eq!(processor.total_attempts(), 5);
}

#[tokio::test]
async fn resume_skips_everything_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let ids = ["a", "b", "c", "d", "e", "f"];
    let processor = StagingProcessor::new(&dir.path().join("work")).broken(&["c"]);
    let c = coordinator(processor.clone(), &dir.path().join("bucket"), RunConfig::default());

    let first = c
        .run(&ListEnumerator::ids(&ids), &checkpoint(dir.path()), CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(first.succeeded, 5);
    assert_eq!(first.failed, 1);
    assert_eq!(processor.attempts("c"), 1);

    let second = c
        .run(&ListEnumerator::ids(&ids), &checkpoint(dir.path()), CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(second.skipped, first.succeeded + first.failed);
    assert_eq!(processor.total_attempts(), 6);
}

#[tokio::test]
async fn uploaded_artifacts_leave_no_local_copy() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let bucket = FsArtifactStore::new(dir.path().join("bucket"));
    let c = coordinator(
        StagingProcessor::new(&work),
        bucket.root(),
        RunConfig::default().with_upload_prefix("filings/2021"),
    );

    c.run(
        &ListEnumerator::ids(&["a", "b"]),
        &checkpoint(dir.path()),
        CancellationToken::new(),
        &Quiet,
    )
    .await
    .unwrap();

    assert_eq!(
        bucket.list("filings/").await.unwrap(),
        vec!["filings/2021/a.pdf", "filings/2021/b.pdf"]
    );
    assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
}

#[tokio::test]
async fn colliding_names_stay_distinct_when_kept_locally() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let c = coordinator(
        StagingProcessor::new(&work),
        &dir.path().join("bucket"),
        RunConfig::default().with_upload(false).with_workers(1),
    );
    let listing = || {
        ListEnumerator::new(vec![
            Ok(unit("2021-order", "https://filings.example.org/2021/order.pdf")),
            Ok(unit("2022-order", "https://filings.example.org/2022/order.pdf")),
        ])
    };

    let first = c
        .run(&listing(), &checkpoint(dir.path()), CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.duplicates, 0);

    let mut names: Vec<_> = std::fs::read_dir(&work)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["order (1).pdf", "order.pdf"]);

    let second = c
        .run(&listing(), &checkpoint(dir.path()), CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(std::fs::read_dir(&work).unwrap().count(), 2);
}

#[tokio::test]
async fn same_name_uploaded_once_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let bucket = FsArtifactStore::new(dir.path().join("bucket"));
    let c = coordinator(
        StagingProcessor::new(&dir.path().join("work")),
        bucket.root(),
        RunConfig::default().with_workers(1),
    );
    let listing = || {
        ListEnumerator::new(vec![
            Ok(unit("first", "https://filings.example.org/a/order.pdf")),
            Ok(unit("second", "https://filings.example.org/b/order.pdf")),
        ])
    };

    let store = checkpoint(dir.path());
    let summary = c
        .run(&listing(), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(summary.duplicates, 1);
    assert_eq!(bucket.list("").await.unwrap(), vec!["order.pdf"]);
    assert_eq!(
        store.get("second").unwrap().metadata.get("duplicate_of").map(String::as_str),
        Some("first")
    );

    let rerun = c
        .run(&listing(), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(rerun.skipped, 2);
    assert_eq!(bucket.list("").await.unwrap().len(), 1);
}

#[tokio::test]
async fn reset_unit_is_processed_again() {
    let dir = tempfile::tempdir().unwrap();
    let processor = StagingProcessor::new(&dir.path().join("work")).broken(&["b"]);
    let c = coordinator(processor.clone(), &dir.path().join("bucket"), RunConfig::default());

    let store = checkpoint(dir.path());
    c.run(&ListEnumerator::ids(&["a", "b"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(store.reset_failed().unwrap(), 1);
    drop(store);

    let store = checkpoint(dir.path());
    let summary = c
        .run(&ListEnumerator::ids(&["a", "b"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!((summary.skipped, summary.failed), (1, 1));
    assert_eq!(processor.attempts("b"), 2);
    assert_eq!(store.status_of("b"), Some(UnitStatus::Failed));
}

#[tokio::test]
async fn enumeration_error_aborts_but_keeps_progress() {
    let dir = tempfile::tempdir().unwrap();
    let c = coordinator(
        StagingProcessor::new(&dir.path().join("work")),
        &dir.path().join("bucket"),
        RunConfig::default().with_workers(1),
    );
    let enumerator = ListEnumerator::new(vec![
        Ok(unit("a", "https://filings.example.org/a.pdf")),
        Err(IngestError::Enumeration("index page 2 unreachable".into())),
    ]);

    let store = checkpoint(dir.path());
    let err = c
        .run(&enumerator, &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    drop(store);

    let reloaded = CheckpointStore::load(&dir.path().join("state").join("checkpoint.csv")).unwrap();
    assert_eq!(reloaded["a"].status, UnitStatus::Success);
}

#[tokio::test]
async fn failed_upload_resumes_from_the_kept_file_after_reset() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"a file where the bucket should be").unwrap();
    let processor = StagingProcessor::new(&work);

    let store = checkpoint(dir.path());
    let first = coordinator(processor.clone(), &blocked, RunConfig::default())
        .run(&ListEnumerator::ids(&["a"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    assert_eq!(first.failed, 1);
    assert!(work.join("a.pdf").exists());

    assert_eq!(store.reset_failed().unwrap(), 1);
    drop(store);

    let store = checkpoint(dir.path());
    let bucket = FsArtifactStore::new(dir.path().join("bucket"));
    let second = coordinator(processor.clone(), bucket.root(), RunConfig::default())
        .run(&ListEnumerator::ids(&["a"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();

    assert_eq!((second.succeeded, second.failed), (1, 0));
    assert_eq!(processor.attempts("a"), 1);
    assert_eq!(bucket.list("").await.unwrap(), vec!["a.pdf"]);
    assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    let record = store.get("a").unwrap();
    assert_eq!(record.status, UnitStatus::Success);
    assert_eq!(record.metadata.get("artifact_key").map(String::as_str), Some("a.pdf"));
    assert!(!record.metadata.contains_key("local_path"));
}

#[tokio::test]
async fn reset_unit_with_missing_kept_file_is_processed_again() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"not a directory").unwrap();
    let processor = StagingProcessor::new(&work);

    let store = checkpoint(dir.path());
    coordinator(processor.clone(), &blocked, RunConfig::default())
        .run(&ListEnumerator::ids(&["a"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();
    std::fs::remove_file(work.join("a.pdf")).unwrap();
    assert!(store.reset_unit("a").unwrap());

    let bucket = FsArtifactStore::new(dir.path().join("bucket"));
    let rerun = coordinator(processor.clone(), bucket.root(), RunConfig::default())
        .run(&ListEnumerator::ids(&["a"]), &store, CancellationToken::new(), &Quiet)
        .await
        .unwrap();

    assert_eq!(rerun.succeeded, 1);
    assert_eq!(processor.attempts("a"), 2);
    assert_eq!(bucket.list("").await.unwrap(), vec!["a.pdf"]);
}
