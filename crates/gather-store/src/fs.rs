use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use gather_core::AppError;
use tokio::fs;
use uuid::Uuid;

/// Write `bytes` to a sibling temp file, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::storage(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| AppError::storage(format!("create {}: {e}", parent.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = fs::write(&tmp, bytes).await {
        return Err(AppError::storage(format!("write {}: {e}", tmp.display())));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(AppError::storage(format!("rename to {}: {e}", path.display())));
    }
    Ok(())
}

/// Directory and path component safe for any filesystem.
pub(crate) fn safe_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// `YYYY-MM-DD` directories directly under `dir`, with their dates.
pub(crate) async fn dated_dirs(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, AppError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::storage(format!("read {}: {e}", dir.display()))),
    };

    let mut dated = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::storage(format!("read {}: {e}", dir.display())))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(date) = NaiveDate::parse_from_str(&name, "%Y-%m-%d") {
            dated.push((date, entry.path()));
        }
    }
    Ok(dated)
}

/// Remove a directory tree, returning how many files it held.
pub(crate) async fn remove_tree(dir: &Path) -> Result<usize, AppError> {
    let mut files = 0usize;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .map_err(|e| AppError::storage(format!("read {}: {e}", current.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::storage(format!("read {}: {e}", current.display())))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                pending.push(entry.path());
            } else {
                files += 1;
            }
        }
    }
    fs::remove_dir_all(dir)
        .await
        .map_err(|e| AppError::storage(format!("remove {}: {e}", dir.display())))?;
    Ok(files)
}
