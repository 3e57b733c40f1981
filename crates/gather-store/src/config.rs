use std::path::{Path, PathBuf};

use gather_core::AppError;

const DEFAULT_DATA_DIR: &str = "data";

/// Where the filesystem stores live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// When false, raw payloads are not archived.
    pub snapshots_enabled: bool,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            snapshots_enabled: true,
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `GATHER_DATA_DIR` (optional, defaults to `./data`)
    /// - `GATHER_SNAPSHOTS` (optional, `true`/`false`, defaults to `true`)
    pub fn from_env() -> Result<Self, AppError> {
        let data_dir = std::env::var("GATHER_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

        let snapshots_enabled = match std::env::var("GATHER_SNAPSHOTS") {
            Err(_) => true,
            Ok(raw) => parse_flag(&raw).ok_or_else(|| {
                AppError::ConfigError(format!(
                    "Invalid GATHER_SNAPSHOTS '{raw}': expected true or false"
                ))
            })?,
        };

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            snapshots_enabled,
        })
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn run_log_dir(&self) -> PathBuf {
        self.data_dir.join("runlogs")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_data_dir() {
        let config = StoreConfig::new("/var/lib/gather");
        assert_eq!(config.snapshot_dir(), PathBuf::from("/var/lib/gather/snapshots"));
        assert_eq!(config.run_log_dir(), PathBuf::from("/var/lib/gather/runlogs"));
        assert_eq!(config.jobs_path(), PathBuf::from("/var/lib/gather/jobs.json"));
        assert!(config.snapshots_enabled);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
