//! Cache statistics and the context that carries them
//!
//! Statistics are loaded once per process into a [`StatisticsContext`] that
//! is handed to the cache on construction. Persisting is best-effort: with
//! several processes sharing a cache the last writer wins, which is accepted
//! for counters that only feed reporting.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::atomic::write_json_atomic;
use crate::error::Result;

/// Aggregate counters for a cache directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheStatistics {
    /// Number of entries
    pub total_entries: u64,
    /// Bytes of cached output
    pub total_size: u64,
    /// Lookups that hit
    pub hit_count: u64,
    /// Lookups that missed
    pub miss_count: u64,
    /// Entries written
    pub store_count: u64,
    /// Entries restored
    pub restore_count: u64,
    /// Running average of store duration
    pub avg_store_time_ms: f64,
    /// Running average of restore duration
    pub avg_restore_time_ms: f64,
    /// When the cache was last pruned
    pub last_pruned: Option<DateTime<Utc>>,
}

/// Fold one observation into a running average.
///
/// `previous_count` is the number of observations already averaged. The first
/// observation seeds the average directly.
pub fn running_average(average: f64, previous_count: u64, observation: f64) -> f64 {
    let observation = sanitize(observation);
    if previous_count == 0 {
        return observation;
    }
    let average = sanitize(average);
    let new_count = previous_count + 1;
    sanitize((average * previous_count as f64 + observation) / new_count as f64)
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

impl CacheStatistics {
    /// Fraction of lookups that hit, 0 when nothing was looked up
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }

    /// Count a lookup hit
    pub fn record_hit(&mut self) {
        self.hit_count += 1;
    }

    /// Count a lookup miss
    pub fn record_miss(&mut self) {
        self.miss_count += 1;
    }

    /// Count a new entry and its duration
    pub fn record_store(&mut self, duration_ms: f64, entry_size: u64) {
        self.avg_store_time_ms = running_average(self.avg_store_time_ms, self.store_count, duration_ms);
        self.store_count += 1;
        self.total_entries += 1;
        self.total_size += entry_size;
    }

    /// Count a restore and its duration
    pub fn record_restore(&mut self, duration_ms: f64) {
        self.avg_restore_time_ms =
            running_average(self.avg_restore_time_ms, self.restore_count, duration_ms);
        self.restore_count += 1;
    }

    /// Count a removed entry
    pub fn record_removal(&mut self, entry_size: u64) {
        self.total_entries = self.total_entries.saturating_sub(1);
        self.total_size = self.total_size.saturating_sub(entry_size);
    }

    /// Replace the entry aggregates with freshly scanned values
    pub fn set_totals(&mut self, entries: u64, size: u64) {
        self.total_entries = entries;
        self.total_size = size;
    }

    /// Repair values a damaged or hand-edited file may contain
    pub fn sanitized(mut self) -> Self {
        self.avg_store_time_ms = sanitize(self.avg_store_time_ms);
        self.avg_restore_time_ms = sanitize(self.avg_restore_time_ms);
        self
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{} B", bytes)
    } else if value < KB * KB {
        format!("{:.1} KB", value / KB)
    } else if value < KB * KB * KB {
        format!("{:.1} MB", value / (KB * KB))
    } else {
        format!("{:.1} GB", value / (KB * KB * KB))
    }
}

/// Shared, process-wide statistics for one cache directory
#[derive(Debug, Clone)]
pub struct StatisticsContext {
    path: Option<PathBuf>,
    inner: Arc<Mutex<CacheStatistics>>,
}

impl StatisticsContext {
    /// Statistics that are never persisted
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Arc::new(Mutex::new(CacheStatistics::default())),
        }
    }

    /// Load statistics from `path`, starting fresh when the file is missing
    /// or unreadable
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stats = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheStatistics>(&bytes) {
                Ok(stats) => stats.sanitized(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable cache statistics");
                    CacheStatistics::default()
                }
            },
            Err(_) => CacheStatistics::default(),
        };

        Self {
            path: Some(path),
            inner: Arc::new(Mutex::new(stats)),
        }
    }

    /// Where statistics are persisted, if anywhere
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, CacheStatistics> {
        // A panic while holding the lock cannot leave counters inconsistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current statistics
    pub fn snapshot(&self) -> CacheStatistics {
        self.lock().clone()
    }

    /// Mutate the statistics in place
    pub fn update<R>(&self, f: impl FnOnce(&mut CacheStatistics) -> R) -> R {
        f(&mut self.lock())
    }

    /// Write the statistics file atomically
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        write_json_atomic(path, &snapshot)?;
        debug!(path = %path.display(), "cache statistics saved");
        Ok(())
    }

    /// Save, logging instead of failing
    pub fn save_best_effort(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist cache statistics");
        }
    }
}
