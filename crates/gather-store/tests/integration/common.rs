use gather_store::{Store, StoreConfig};
use tempfile::TempDir;

/// A store rooted in a fresh temp directory. Keep the `TempDir` alive for
/// the duration of the test.
pub async fn setup_test_store() -> (Store, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Store::open(StoreConfig::new(dir.path().join("data"))).await;
    (store, dir)
}

/// Number of regular files anywhere under `dir`.
pub fn count_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|e| {
            let path = e.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}
