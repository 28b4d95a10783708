use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheMode;

/// Per-area quota (5 MiB).
pub const DEFAULT_QUOTA: usize = 5 * 1024 * 1024;

/// Slack above the quota granted to areas (100 KiB).
pub const QUOTA_OVERAGE_ALLOWANCE: usize = 100 * 1024;

/// Delay before a fresh batch is flushed.
pub const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(5);

/// Delay used once aggressive flushing is on.
pub const AGGRESSIVE_COMMIT_DELAY: Duration = Duration::from_secs(1);

/// Commits allowed per map per hour before flushes are spaced out.
pub const DEFAULT_MAX_COMMITS_PER_HOUR: u64 = 60;

/// Tunables shared by every map of a storage context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaOptions {
    /// Maximum stored bytes (keys plus values) per area.
    pub max_size: usize,
    /// Minimum delay between a batch being created and flushed.
    pub default_commit_delay: Duration,
    /// Bytes each map may commit per hour before flushes are delayed.
    pub max_bytes_per_hour: u64,
    /// Commits each map may issue per hour before flushes are delayed.
    pub max_commits_per_hour: u64,
    /// Cache mode new maps start in.
    pub cache_mode: CacheMode,
}

impl Default for AreaOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_QUOTA + QUOTA_OVERAGE_ALLOWANCE,
            default_commit_delay: DEFAULT_COMMIT_DELAY,
            max_bytes_per_hour: DEFAULT_QUOTA as u64,
            max_commits_per_hour: DEFAULT_MAX_COMMITS_PER_HOUR,
            cache_mode: CacheMode::KeysAndValues,
        }
    }
}

impl AreaOptions {
    /// Defaults with a short commit delay so tests do not wait seconds.
    pub fn for_testing() -> Self {
        Self {
            default_commit_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Defaults for hosts that prefer memory over read latency.
    pub fn low_memory() -> Self {
        Self {
            cache_mode: CacheMode::KeysOnly,
            ..Default::default()
        }
    }
}
