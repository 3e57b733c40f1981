use crate::config::StoreConfig;
use crate::job_store::FileJobStore;
use crate::run_log::FsRunLogSink;
use crate::snapshot::FsSnapshotSink;

/// Filesystem store facade: owns the data directory layout and vends the
/// snapshot sink, run-log sink and job store.
#[derive(Debug, Clone)]
pub struct Store {
    config: StoreConfig,
}

impl Store {
    /// Create the data directories if they do not exist. Failure only logs:
    /// the sinks then degrade to no-ops and the job store reports its own
    /// errors.
    pub async fn open(config: StoreConfig) -> Self {
        for dir in [config.snapshot_dir(), config.run_log_dir()] {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                tracing::warn!(dir = %dir.display(), error = %e, "Data directory unavailable");
            }
        }
        tracing::debug!(data_dir = %config.data_dir.display(), "Store opened");
        Self { config }
    }

    pub fn snapshot_sink(&self) -> FsSnapshotSink {
        if self.config.snapshots_enabled {
            FsSnapshotSink::new(self.config.snapshot_dir())
        } else {
            FsSnapshotSink::disabled(self.config.snapshot_dir())
        }
    }

    pub fn run_log_sink(&self) -> FsRunLogSink {
        FsRunLogSink::new(self.config.run_log_dir())
    }

    pub fn job_store(&self) -> FileJobStore {
        FileJobStore::new(self.config.jobs_path())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
