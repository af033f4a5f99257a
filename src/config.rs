use crate::wal::RecoveryPolicy;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Storage engine configuration
///
/// Missing fields in a config file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for segments (created if absent)
    pub data_dir: PathBuf,

    /// MemTable size that triggers a flush, in megabytes (default: 512)
    pub max_memory_mb: usize,

    /// Accepted for the request layer; the engine flushes on size only
    #[serde(rename = "flush_interval_seconds")]
    pub flush_interval_secs: u64,

    /// Accepted but not enforced yet
    pub retention_days: u32,

    /// Snappy-compress segment blocks (default: true)
    pub compression_enabled: bool,

    pub wal_enabled: bool,

    /// Required when `wal_enabled` is set
    pub wal_path: PathBuf,

    /// How a torn trailing WAL frame is handled at startup (default: strict)
    pub wal_recovery: RecoveryPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_memory_mb: 512,
            flush_interval_secs: 60,
            retention_days: 7,
            compression_enabled: true,
            wal_enabled: true,
            wal_path: PathBuf::from("./data/wal.log"),
            wal_recovery: RecoveryPolicy::Strict,
        }
    }
}

impl StorageConfig {
    /// Config rooted at `dir`, with the WAL at `dir/wal.log`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let data_dir = dir.into();
        Self {
            wal_path: data_dir.join("wal.log"),
            data_dir,
            ..Default::default()
        }
    }

    /// Load from a JSON file, or return defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = match path {
            Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfig("data_dir must not be empty".into()));
        }
        if self.max_memory_mb == 0 {
            return Err(StorageError::InvalidConfig(
                "max_memory_mb must be positive".into(),
            ));
        }
        if self.wal_enabled && self.wal_path.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfig(
                "wal_path is required when wal_enabled is set".into(),
            ));
        }
        Ok(())
    }

    /// Set MemTable flush threshold
    pub fn max_memory_mb(mut self, mb: usize) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Enable or disable segment compression
    pub fn compression_enabled(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn wal_enabled(mut self, enabled: bool) -> Self {
        self.wal_enabled = enabled;
        self
    }

    pub fn wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = path.into();
        self
    }

    pub fn wal_recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.wal_recovery = policy;
        self
    }
}
