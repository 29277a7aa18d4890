//! Cache maintenance: prune, verify and clean

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::atomic::{remove_dir_atomic, STAGING_PREFIX, TRASH_PREFIX};
use crate::error::{IoResultExt, Result};
use crate::fileops::hash_file;
use crate::manager::SharedCache;
use crate::manifest::{read_manifest, CacheManifest, EntryDir};

/// Staging directories older than this are leftovers of killed writers
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of a prune
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneResult {
    /// Entries examined
    pub scanned: usize,
    /// Entries removed for exceeding the age limit
    pub removed_by_age: usize,
    /// Entries removed to get under the size limit
    pub removed_by_size: usize,
    /// Bytes freed
    pub freed_bytes: u64,
    /// Entries left
    pub remaining_entries: usize,
    /// Bytes left
    pub remaining_bytes: u64,
    /// Entries that could not be deleted
    pub failures: usize,
    /// Abandoned staging directories cleaned up
    pub stale_staging_removed: usize,
}

impl PruneResult {
    /// Total entries removed
    pub fn removed(&self) -> usize {
        self.removed_by_age + self.removed_by_size
    }
}

/// An entry that failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptEntry {
    /// Entry directory name
    pub key: String,
    /// What is wrong with it
    pub reason: String,
}

/// Result of verifying every entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    /// Entries checked
    pub total: usize,
    /// Entries whose outputs all match their recorded hashes
    pub valid: usize,
    /// Entries that did not
    pub corrupt: Vec<CorruptEntry>,
    /// Corrupt entries deleted (only with `fix`)
    pub removed: usize,
}

/// Result of clearing the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanResult {
    /// Entries deleted
    pub removed_entries: usize,
    /// Bytes freed
    pub freed_bytes: u64,
}

/// An entry found on disk
struct ScannedEntry {
    name: String,
    dir: EntryDir,
    manifest: Result<CacheManifest>,
    last_accessed: DateTime<Utc>,
}

impl ScannedEntry {
    fn size(&self) -> u64 {
        self.manifest.as_ref().map(CacheManifest::total_size).unwrap_or(0)
    }
}

impl SharedCache {
    /// Entry directories, skipping in-flight staging and trash directories
    fn scan_entries(&self) -> Result<Vec<ScannedEntry>> {
        let entries_dir = self.layout().entries_dir();
        let mut scanned = Vec::new();

        for dirent in fs::read_dir(&entries_dir).at(&entries_dir)? {
            let dirent = dirent.at(&entries_dir)?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !dirent.path().is_dir() {
                continue;
            }

            let dir = EntryDir::new(dirent.path());
            let manifest = read_manifest(&dir.manifest_path());
            let last_accessed = match &manifest {
                Ok(m) => m.last_accessed_at,
                // Unreadable entries age by their directory timestamp
                Err(_) => dirent
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)),
            };

            scanned.push(ScannedEntry {
                name,
                dir,
                manifest,
                last_accessed,
            });
        }

        Ok(scanned)
    }

    /// Delete an entry; failures are logged and reported as `false`
    fn remove_entry(&self, entry: &ScannedEntry) -> bool {
        match remove_dir_atomic(entry.dir.path()) {
            Ok(true) => true,
            Ok(false) => {
                debug!(key = %entry.name, "entry already removed by another process");
                true
            }
            Err(e) => {
                warn!(key = %entry.name, error = %e, "failed to delete cache entry");
                false
            }
        }
    }

    /// Remove staging and trash directories left behind by killed processes.
    ///
    /// Entry trash lives next to the entries, while a cleaned entries
    /// directory is trashed one level up in the layout root.
    fn remove_stale_staging(&self) -> usize {
        let layout = self.layout();
        remove_leftovers(&layout.entries_dir(), &[STAGING_PREFIX, TRASH_PREFIX], STALE_STAGING_AGE)
            + remove_leftovers(layout.base_dir(), &[TRASH_PREFIX], STALE_STAGING_AGE)
    }

    /// Evict entries: first everything older than `max_age_days`, then the
    /// least recently accessed until the total size fits `max_size_bytes`
    #[instrument(skip(self))]
    pub fn prune(&self, max_size_bytes: u64, max_age_days: u64) -> Result<PruneResult> {
        info!("pruning shared cache");
        let mut entries = self.scan_entries()?;
        entries.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed).then_with(|| a.name.cmp(&b.name)));

        let mut result = PruneResult {
            scanned: entries.len(),
            ..Default::default()
        };

        let cutoff = Utc::now() - chrono::Duration::days(max_age_days.min(i64::MAX as u64 / 86_400) as i64);
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.last_accessed < cutoff {
                if self.remove_entry(&entry) {
                    result.removed_by_age += 1;
                    result.freed_bytes += entry.size();
                } else {
                    result.failures += 1;
                    kept.push(entry);
                }
            } else {
                kept.push(entry);
            }
        }

        let mut total: u64 = kept.iter().map(ScannedEntry::size).sum();
        let mut remaining = Vec::with_capacity(kept.len());
        for entry in kept {
            if total > max_size_bytes {
                let size = entry.size();
                if self.remove_entry(&entry) {
                    result.removed_by_size += 1;
                    result.freed_bytes += size;
                    total -= size;
                    continue;
                }
                result.failures += 1;
            }
            remaining.push(entry);
        }

        result.remaining_entries = remaining.len();
        result.remaining_bytes = total;
        result.stale_staging_removed = self.remove_stale_staging();

        self.statistics_context().update(|s| {
            s.set_totals(result.remaining_entries as u64, result.remaining_bytes);
            s.last_pruned = Some(Utc::now());
        });
        self.flush_statistics();

        info!(
            removed = result.removed(),
            freed_bytes = result.freed_bytes,
            remaining = result.remaining_entries,
            failures = result.failures,
            "cache prune complete"
        );
        Ok(result)
    }

    /// Prune with the configured thresholds
    pub fn prune_with_settings(&self) -> Result<PruneResult> {
        let settings = self.settings();
        self.prune(settings.max_size_bytes(), settings.max_age_days)
    }

    /// Re-hash every stored output; with `fix`, delete entries that fail
    #[instrument(skip(self))]
    pub fn verify(&self, fix: bool) -> Result<VerifyReport> {
        let entries = self.scan_entries()?;
        let mut report = VerifyReport {
            total: entries.len(),
            ..Default::default()
        };
        let mut live_entries = 0u64;
        let mut live_bytes = 0u64;

        for entry in &entries {
            match check_entry(entry) {
                None => {
                    report.valid += 1;
                    live_entries += 1;
                    live_bytes += entry.size();
                }
                Some(reason) => {
                    warn!(key = %entry.name, reason = %reason, "corrupt cache entry");
                    let removed = fix && self.remove_entry(entry);
                    if removed {
                        report.removed += 1;
                    } else {
                        live_entries += 1;
                        live_bytes += entry.size();
                    }
                    report.corrupt.push(CorruptEntry {
                        key: entry.name.clone(),
                        reason,
                    });
                }
            }
        }

        if fix {
            self.statistics_context()
                .update(|s| s.set_totals(live_entries, live_bytes));
            self.flush_statistics();
        }

        info!(
            total = report.total,
            valid = report.valid,
            corrupt = report.corrupt.len(),
            removed = report.removed,
            "cache verification complete"
        );
        Ok(report)
    }

    /// Delete every entry and reset statistics
    #[instrument(skip(self))]
    pub fn clean(&self) -> Result<CleanResult> {
        let entries_dir: PathBuf = self.layout().entries_dir();
        fs::create_dir_all(&entries_dir).at(&entries_dir)?;

        let entries = self.scan_entries()?;
        let result = CleanResult {
            removed_entries: entries.len(),
            freed_bytes: entries.iter().map(ScannedEntry::size).sum(),
        };

        let removed = remove_dir_atomic(&entries_dir);
        // Recreate before reporting a failed trash deletion
        fs::create_dir_all(&entries_dir).at(&entries_dir)?;
        removed?;

        self.statistics_context().update(|s| *s = Default::default());
        self.flush_statistics();
        remove_leftovers(self.layout().base_dir(), &[TRASH_PREFIX], Duration::ZERO);

        info!(removed = result.removed_entries, freed_bytes = result.freed_bytes, "cache cleaned");
        Ok(result)
    }
}

/// Delete directories in `dir` named with one of `prefixes` and older than `min_age`
fn remove_leftovers(dir: &Path, prefixes: &[&str], min_age: Duration) -> usize {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return 0;
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for dirent in read_dir.flatten() {
        let name = dirent.file_name().to_string_lossy().into_owned();
        if !prefixes.iter().any(|prefix| name.starts_with(prefix)) || !dirent.path().is_dir() {
            continue;
        }
        let age = dirent
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < min_age {
            continue;
        }
        match fs::remove_dir_all(dirent.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %dirent.path().display(), error = %e, "failed to remove leftover directory"),
        }
    }
    debug!(dir = %dir.display(), removed, "swept leftover directories");
    removed
}

/// Why an entry is corrupt, or `None` when every output checks out
fn check_entry(entry: &ScannedEntry) -> Option<String> {
    let manifest = match &entry.manifest {
        Ok(m) => m,
        Err(e) => return Some(e.to_string()),
    };

    if manifest.cache_key != entry.name {
        return Some(format!("manifest key {} does not match directory", manifest.cache_key));
    }

    for file in &manifest.output_files {
        let path = entry.dir.file_path(&file.path);
        match hash_file(&path) {
            Ok(hash) if hash == file.hash => {}
            Ok(_) => return Some(format!("hash mismatch for {}", file.path)),
            Err(e) => return Some(format!("cannot read {}: {}", file.path, e)),
        }
    }

    None
}
