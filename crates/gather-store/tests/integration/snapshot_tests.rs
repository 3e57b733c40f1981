use chrono::{NaiveDate, TimeZone, Utc};
use gather_core::models::RawEventData;
use gather_core::traits::SnapshotSink;
use gather_store::{FsSnapshotSink, Store, StoreConfig};

use crate::common::{count_files, setup_test_store};

fn raw_on(source_id: &str, content: &str, day: u32) -> RawEventData {
    let mut raw = RawEventData::new(
        source_id,
        "https://example.jp/feed.xml",
        content,
        Some("application/rss+xml".to_string()),
    );
    raw.extracted_at = Utc.with_ymd_and_hms(2026, 4, day, 6, 0, 0).unwrap();
    raw
}

#[tokio::test]
async fn save_writes_content_under_source_and_day() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.snapshot_sink();
    let raw = raw_on("morioka-city", "<rss/>", 3);

    let path = sink.save(&raw).await.unwrap();

    assert!(path.starts_with(sink.root().join("morioka-city").join("2026-04-03")));
    assert!(
        path.file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&raw.fingerprint)
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "<rss/>");
}

#[tokio::test]
async fn identical_payload_is_saved_once() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.snapshot_sink();

    let first = sink.save(&raw_on("a", "same", 3)).await.unwrap();
    let second = sink.save(&raw_on("a", "same", 3)).await.unwrap();
    sink.save(&raw_on("a", "different", 3)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(count_files(sink.root()), 2);
}

#[tokio::test]
async fn source_id_cannot_escape_root() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.snapshot_sink();

    let path = sink.save(&raw_on("../../etc", "x", 3)).await.unwrap();
    assert!(path.starts_with(sink.root()));
}

#[tokio::test]
async fn disabled_sink_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::new(dir.path());
    config.snapshots_enabled = false;
    let store = Store::open(config).await;
    let sink = store.snapshot_sink();

    assert!(sink.save(&raw_on("a", "payload", 3)).await.is_none());
    assert_eq!(count_files(sink.root()), 0);
}

#[tokio::test]
async fn prune_spans_all_sources() {
    let (store, _dir) = setup_test_store().await;
    let sink = store.snapshot_sink();

    sink.save(&raw_on("a", "old-1", 1)).await.unwrap();
    sink.save(&raw_on("a", "old-2", 1)).await.unwrap();
    sink.save(&raw_on("b", "old-3", 2)).await.unwrap();
    sink.save(&raw_on("b", "fresh", 20)).await.unwrap();

    let cutoff = NaiveDate::from_ymd_opt(2026, 4, 15).unwrap();
    assert_eq!(sink.prune_before(cutoff).await.unwrap(), 3);
    assert_eq!(count_files(sink.root()), 1);
}

#[tokio::test]
async fn prune_on_missing_root_is_zero() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FsSnapshotSink::new(dir.path().join("never-created"));
    let cutoff = NaiveDate::from_ymd_opt(2026, 4, 15).unwrap();
    assert_eq!(sink.prune_before(cutoff).await.unwrap(), 0);
}
