use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use domstore_area::{AreaOptions, CacheMode};
use domstore_db::LogOptions;

/// Consecutive failed commits tolerated before the database is recreated.
pub const DEFAULT_COMMIT_ERROR_THRESHOLD: u32 = 8;

/// Configuration for a [`StorageContext`](crate::StorageContext).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Directory of the on-disk database. `None` keeps everything in memory.
    pub directory: Option<PathBuf>,
    /// Quota, commit pacing, and cache mode of every area.
    pub area: AreaOptions,
    /// Start maps in keys-only mode regardless of `area.cache_mode`.
    pub low_memory: bool,
    /// Consecutive failed commits tolerated before recreating the database.
    pub commit_error_threshold: u32,
    /// On-disk log tuning.
    pub log: LogOptions,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            directory: None,
            area: AreaOptions::default(),
            low_memory: false,
            commit_error_threshold: DEFAULT_COMMIT_ERROR_THRESHOLD,
            log: LogOptions::default(),
        }
    }
}

impl ContextConfig {
    /// A context persisting to `directory` with default settings.
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Default::default()
        }
    }

    /// Short commit delays for tests.
    pub fn for_testing() -> Self {
        Self {
            area: AreaOptions::for_testing(),
            ..Default::default()
        }
    }

    /// Area options with the low-memory override applied.
    pub fn effective_area_options(&self) -> AreaOptions {
        let mut options = self.area.clone();
        if self.low_memory {
            options.cache_mode = CacheMode::KeysOnly;
        }
        options
    }
}
