use chrono::{NaiveDate, TimeZone, Utc};
use gather_core::models::{RunLogEntry, SourceStatus};
use gather_core::traits::RunLogSink;
use uuid::Uuid;

use crate::common::{count_files, setup_test_store};

fn entry(run_id: Uuid, source_id: &str, day: u32) -> RunLogEntry {
    let started_at = Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap();
    RunLogEntry {
        run_id,
        source_id: source_id.to_string(),
        started_at,
        finished_at: started_at + chrono::TimeDelta::seconds(3),
        status: SourceStatus::Success,
        fetched: 1,
        parsed: 4,
        upserted: 4,
        error: None,
        snapshot_paths: vec![],
    }
}

#[tokio::test]
async fn append_groups_entries_by_run() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.run_log_sink();
    let run_id = Uuid::new_v4();

    let first = sink.append(&entry(run_id, "morioka", 2)).await.unwrap();
    let mut failed = entry(run_id, "hanamaki", 2);
    failed.status = SourceStatus::Fail;
    failed.error = Some("HTTP 503".to_string());
    let second = sink.append(&failed).await.unwrap();

    assert_eq!(first, second);
    assert!(first.ends_with(format!("2026-03-02/{run_id}.json")));

    let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    let entries = sink.read_run(date, run_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].source_id, "morioka");
    assert_eq!(entries[1], failed);
}

#[tokio::test]
async fn concurrent_appends_keep_every_entry() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.run_log_sink();
    let run_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..10 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            sink.append(&entry(run_id, &format!("source-{i}"), 5)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_some());
    }

    let date = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
    assert_eq!(sink.read_run(date, run_id).await.unwrap().len(), 10);
}

#[tokio::test]
async fn unknown_run_reads_empty() {
    let (store, _dir) = setup_test_store().await;
    let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let entries = store
        .run_log_sink()
        .read_run(date, Uuid::new_v4())
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn prune_removes_only_older_days() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.run_log_sink();

    sink.append(&entry(Uuid::new_v4(), "a", 1)).await.unwrap();
    sink.append(&entry(Uuid::new_v4(), "a", 2)).await.unwrap();
    sink.append(&entry(Uuid::new_v4(), "a", 10)).await.unwrap();

    let cutoff = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
    let removed = sink.prune_before(cutoff).await.unwrap();

    assert_eq!(removed, 2);
    assert_eq!(count_files(sink.root()), 1);
    assert!(sink.root().join("2026-03-10").is_dir());
}

#[tokio::test]
async fn unwritable_root_is_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("runlogs");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let sink = gather_store::FsRunLogSink::new(&blocker);
    assert!(sink.append(&entry(Uuid::new_v4(), "a", 1)).await.is_none());
}
