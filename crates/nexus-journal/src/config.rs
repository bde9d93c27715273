//! Journal configuration.
//!
//! This module provides configuration options for the journal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalResult};
use crate::format::{self, MIN_FILE_SIZE};

/// Default journal file size (10 MB).
pub const DEFAULT_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Configuration for the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Directory where journal files are stored.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Size of every journal file in bytes.
    #[serde(default = "default_file_size")]
    pub file_size: usize,

    /// Number of files kept pre-allocated (data files plus free files).
    #[serde(default = "default_min_files")]
    pub min_files: usize,

    /// Compaction only runs with more data files than this. Zero disables it.
    #[serde(default = "default_compact_min_files")]
    pub compact_min_files: usize,

    /// Compaction runs when live data falls below this percentage of the data files.
    #[serde(default = "default_compact_percentage")]
    pub compact_percentage: u32,

    /// File name prefix.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// File name extension (without the dot).
    #[serde(default = "default_file_extension")]
    pub file_extension: String,

    /// Caller-defined version stamped into every file header.
    #[serde(default)]
    pub user_version: u32,

    /// How long a rotation waits for a pre-opened file before creating one.
    #[serde(default = "default_open_file_timeout", with = "duration_millis")]
    pub open_file_timeout: Duration,

    /// How long `stop` waits for each background executor to drain.
    #[serde(default = "default_shutdown_timeout", with = "duration_millis")]
    pub executor_shutdown_timeout: Duration,

    /// How long a synchronous append waits for its write to complete.
    #[serde(default = "default_sync_timeout", with = "duration_millis")]
    pub sync_timeout: Duration,
}

fn default_dir() -> PathBuf {
    PathBuf::from("data/journal")
}

fn default_file_size() -> usize {
    DEFAULT_FILE_SIZE
}

fn default_min_files() -> usize {
    2
}

fn default_compact_min_files() -> usize {
    10
}

fn default_compact_percentage() -> u32 {
    30
}

fn default_file_prefix() -> String {
    "nexus-data".to_string()
}

fn default_file_extension() -> String {
    "njr".to_string()
}

fn default_open_file_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            file_size: default_file_size(),
            min_files: default_min_files(),
            compact_min_files: default_compact_min_files(),
            compact_percentage: default_compact_percentage(),
            file_prefix: default_file_prefix(),
            file_extension: default_file_extension(),
            user_version: 0,
            open_file_timeout: default_open_file_timeout(),
            executor_shutdown_timeout: default_shutdown_timeout(),
            sync_timeout: default_sync_timeout(),
        }
    }
}

impl JournalConfig {
    /// Creates a new journal configuration with the specified directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> JournalResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| JournalError::config_error(e.to_string()))
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> JournalResult<String> {
        toml::to_string_pretty(self).map_err(|e| JournalError::config_error(e.to_string()))
    }

    /// Sets the file size.
    #[must_use]
    pub fn with_file_size(mut self, size: usize) -> Self {
        self.file_size = size;
        self
    }

    /// Sets the minimum number of files.
    #[must_use]
    pub fn with_min_files(mut self, count: usize) -> Self {
        self.min_files = count;
        self
    }

    /// Sets the compaction file threshold.
    #[must_use]
    pub fn with_compact_min_files(mut self, count: usize) -> Self {
        self.compact_min_files = count;
        self
    }

    /// Sets the compaction live-data percentage.
    #[must_use]
    pub fn with_compact_percentage(mut self, percentage: u32) -> Self {
        self.compact_percentage = percentage;
        self
    }

    /// Sets the file name prefix.
    #[must_use]
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Sets the file name extension.
    #[must_use]
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Sets the user version.
    #[must_use]
    pub fn with_user_version(mut self, version: u32) -> Self {
        self.user_version = version;
        self
    }

    /// Sets the pre-opened file wait.
    #[must_use]
    pub fn with_open_file_timeout(mut self, timeout: Duration) -> Self {
        self.open_file_timeout = timeout;
        self
    }

    /// Sets the executor shutdown wait.
    #[must_use]
    pub fn with_executor_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.executor_shutdown_timeout = timeout;
        self
    }

    /// Sets the synchronous write wait.
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Validates the configuration against the file factory's alignment.
    pub fn validate(&self, alignment: usize) -> Result<(), String> {
        if self.file_size < MIN_FILE_SIZE {
            return Err(format!(
                "File size {} must be at least {} bytes",
                self.file_size, MIN_FILE_SIZE
            ));
        }

        if alignment == 0 || self.file_size % alignment != 0 {
            return Err(format!(
                "Invalid journal file size {}, it should be a multiple of {}",
                self.file_size, alignment
            ));
        }

        if self.min_files < 2 {
            return Err("Min files cannot be less than 2".to_string());
        }

        if self.compact_percentage > 100 {
            return Err("Compact percentage out of range".to_string());
        }

        if self.file_prefix.is_empty() || self.file_extension.is_empty() {
            return Err("File prefix and extension must not be empty".to_string());
        }

        if self.file_extension.contains('.') {
            return Err("File extension must not contain '.'".to_string());
        }

        Ok(())
    }

    /// Returns the compaction threshold as a fraction.
    pub fn compact_ratio(&self) -> f64 {
        f64::from(self.compact_percentage) / 100.0
    }

    /// Returns the file name for a given file id.
    pub fn file_name(&self, file_id: u64) -> String {
        format::file_name(&self.file_prefix, file_id, &self.file_extension)
    }
}
