use gather_core::job::{JobStatus, JobType};
use gather_core::job_store::JobStore;
use gather_core::testutil::make_test_job;
use gather_store::FileJobStore;

use crate::common::setup_test_store;

#[tokio::test]
async fn load_without_file_is_empty() {
    let (store, _dir) = setup_test_store().await;
    let jobs = store.job_store().load().await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn save_then_load_preserves_jobs() {
    let (store, _dir) = setup_test_store().await;
    let job_store = store.job_store();

    let mut failed = make_test_job("cleanup", JobType::Cleanup);
    failed.status = JobStatus::Failed;
    failed.retry_count = 2;
    failed.last_error = Some("disk full".to_string());
    let jobs = vec![make_test_job("nightly", JobType::Maintenance), failed];

    job_store.save(&jobs).await.unwrap();
    let loaded = job_store.load().await.unwrap();

    assert_eq!(loaded, jobs);
}

#[tokio::test]
async fn save_replaces_previous_contents() {
    let (store, _dir) = setup_test_store().await;
    let job_store = store.job_store();

    job_store
        .save(&[
            make_test_job("a", JobType::Maintenance),
            make_test_job("b", JobType::Cleanup),
        ])
        .await
        .unwrap();
    job_store
        .save(&[make_test_job("c", JobType::Cleanup)])
        .await
        .unwrap();

    let loaded = job_store.load().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].name, "c");
}

#[tokio::test]
async fn corrupt_file_is_a_storage_error() {
    let (store, _dir) = setup_test_store().await;
    let job_store = store.job_store();
    std::fs::write(job_store.path(), b"{not json").unwrap();

    let err = job_store.load().await.unwrap_err();
    assert!(matches!(err, gather_core::AppError::StorageError(_)));
}

#[tokio::test]
async fn concurrent_saves_leave_a_readable_file() {
    let dir = tempfile::tempdir().unwrap();
    let job_store = FileJobStore::new(dir.path().join("jobs.json"));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = job_store.clone();
        handles.push(tokio::spawn(async move {
            let job = make_test_job(&format!("job-{i}"), JobType::Maintenance);
            store.save(&[job]).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let loaded = job_store.load().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded[0].name.starts_with("job-"));
}
