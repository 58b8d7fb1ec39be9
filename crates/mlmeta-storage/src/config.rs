use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How long a writer waits for the write lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Keys per `IN (...)` lookup when locking latest-metric rows.
    #[serde(default = "default_latest_metrics_chunk_size")]
    pub latest_metrics_chunk_size: usize,
    #[serde(default = "default_artifact_root")]
    pub default_artifact_root: String,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_latest_metrics_chunk_size() -> usize {
    500
}

fn default_artifact_root() -> String {
    "./mlruns".to_string()
}

impl StoreConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: JournalMode::default(),
            latest_metrics_chunk_size: default_latest_metrics_chunk_size(),
            default_artifact_root: default_artifact_root(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY_PATH)
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::InvalidParameterValue(
                "store path must not be empty".to_string(),
            ));
        }
        if self.latest_metrics_chunk_size == 0 {
            return Err(StoreError::InvalidParameterValue(
                "latest_metrics_chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
