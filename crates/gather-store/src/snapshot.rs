use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use gather_core::AppError;
use gather_core::models::RawEventData;
use gather_core::traits::SnapshotSink;

use crate::fs::{dated_dirs, remove_tree, safe_component, write_atomic};

/// Archives raw payloads as
/// `<root>/<source_id>/<YYYY-MM-DD>/<fingerprint>.<ext>`.
///
/// Files are content-addressed, so re-saving an unchanged payload on the
/// same day is a no-op. Write failures are logged and swallowed.
#[derive(Debug, Clone)]
pub struct FsSnapshotSink {
    root: PathBuf,
    enabled: bool,
}

impl FsSnapshotSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            enabled: true,
        }
    }

    /// A sink that never writes.
    pub fn disabled(root: impl Into<PathBuf>) -> Self {
        Self {
            enabled: false,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, raw: &RawEventData) -> PathBuf {
        self.root
            .join(safe_component(&raw.source_id))
            .join(raw.extracted_at.format("%Y-%m-%d").to_string())
            .join(format!("{}.{}", raw.fingerprint, raw.snapshot_extension()))
    }
}

impl SnapshotSink for FsSnapshotSink {
    async fn save(&self, raw: &RawEventData) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let path = self.path_for(raw);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some(path);
        }
        match write_atomic(&path, raw.content.as_bytes()).await {
            Ok(()) => {
                tracing::debug!(source_id = %raw.source_id, path = %path.display(), "Snapshot saved");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(source_id = %raw.source_id, error = %e, "Snapshot not saved");
                None
            }
        }
    }

    async fn prune_before(&self, cutoff: NaiveDate) -> Result<usize, AppError> {
        let mut sources = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(AppError::storage(format!(
                    "read {}: {e}",
                    self.root.display()
                )));
            }
        };

        let mut removed = 0usize;
        while let Some(source_dir) = sources
            .next_entry()
            .await
            .map_err(|e| AppError::storage(format!("read {}: {e}", self.root.display())))?
        {
            for (date, dir) in dated_dirs(&source_dir.path()).await? {
                if date < cutoff {
                    removed += remove_tree(&dir).await?;
                }
            }
        }

        tracing::info!(removed, %cutoff, "Pruned snapshots");
        Ok(removed)
    }
}
