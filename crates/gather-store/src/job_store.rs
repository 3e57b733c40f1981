use std::path::{Path, PathBuf};
use std::sync::Arc;

use gather_core::AppError;
use gather_core::job::ScheduledJob;
use gather_core::job_store::JobStore;
use tokio::sync::Mutex;

use crate::fs::write_atomic;

/// All scheduled jobs in one JSON file, rewritten atomically on every save.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobStore for FileJobStore {
    async fn load(&self) -> Result<Vec<ScheduledJob>, AppError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No job file yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(AppError::storage(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let jobs: Vec<ScheduledJob> = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::storage(format!("corrupt job file {}: {e}", self.path.display()))
        })?;
        tracing::debug!(count = jobs.len(), "Loaded scheduled jobs");
        Ok(jobs)
    }

    async fn save(&self, jobs: &[ScheduledJob]) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(jobs)?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, &bytes).await
    }
}
