use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use gather_core::AppError;
use gather_core::models::RunLogEntry;
use gather_core::traits::RunLogSink;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fs::{dated_dirs, remove_tree, write_atomic};

/// Run logs as `<root>/<YYYY-MM-DD>/<run_id>.json`, each file a JSON array
/// holding one entry per source attempt of that run.
///
/// Appends rewrite the file atomically and are serialized through a shared
/// lock, so clones of one sink can be used from concurrent tasks.
#[derive(Debug, Clone)]
pub struct FsRunLogSink {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FsRunLogSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, date: NaiveDate, run_id: Uuid) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{run_id}.json"))
    }

    /// Entries recorded for a run on the given day; empty if none.
    pub async fn read_run(
        &self,
        date: NaiveDate,
        run_id: Uuid,
    ) -> Result<Vec<RunLogEntry>, AppError> {
        read_entries(&self.path_for(date, run_id)).await
    }

    async fn try_append(&self, entry: &RunLogEntry) -> Result<PathBuf, AppError> {
        let path = self.path_for(entry.started_at.date_naive(), entry.run_id);
        let _guard = self.write_lock.lock().await;

        let mut entries = read_entries(&path).await?;
        entries.push(entry.clone());
        let bytes = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }
}

async fn read_entries(path: &Path) -> Result<Vec<RunLogEntry>, AppError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| AppError::storage(format!("corrupt run log {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(AppError::storage(format!("read {}: {e}", path.display()))),
    }
}

impl RunLogSink for FsRunLogSink {
    async fn append(&self, entry: &RunLogEntry) -> Option<PathBuf> {
        match self.try_append(entry).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(
                    run_id = %entry.run_id,
                    source_id = %entry.source_id,
                    error = %e,
                    "Run log not written"
                );
                None
            }
        }
    }

    async fn prune_before(&self, cutoff: NaiveDate) -> Result<usize, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0usize;
        for (date, dir) in dated_dirs(&self.root).await? {
            if date < cutoff {
                removed += remove_tree(&dir).await?;
            }
        }
        tracing::info!(removed, %cutoff, "Pruned run logs");
        Ok(removed)
    }
}
