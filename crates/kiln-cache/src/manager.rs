//! Shared cache manager: lookup, store and restore

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use kiln_core::config::SharedCacheSettings;
use tracing::{debug, info, instrument, warn};

use crate::atomic::{PublishOutcome, StagingDir};
use crate::error::{CacheError, IoResultExt, Result};
use crate::fileops::{copy_file, hash_file_with_size, is_binary_file, is_safe_relative_path};
use crate::key::{compute_cache_key, CacheKey, CacheKeyInputs};
use crate::layout::CacheLayout;
use crate::manifest::{
    read_manifest, touch_manifest, write_manifest, CacheManifest, EntryDir, OutputFileRecord,
    MANIFEST_VERSION,
};
use crate::stats::{CacheStatistics, StatisticsContext};

/// Why a lookup did not produce a usable entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// No entry under the key
    NotFound,
    /// Manifest could not be read or failed validation
    CorruptManifest(String),
    /// Manifest was stored under a different key than its directory
    KeyMismatch,
    /// Entry was produced on another platform
    PlatformMismatch {
        /// Platform of the current process
        expected: String,
        /// Platform recorded in the entry
        found: String,
    },
    /// Entry was produced with another runtime version
    RuntimeMismatch {
        /// Current runtime version
        expected: String,
        /// Runtime version recorded in the entry
        found: String,
    },
    /// Entry was produced against another lockfile
    LockfileMismatch,
    /// A stored output file is missing from the entry
    MissingOutput(String),
    /// Filesystem error while reading the entry
    Io(String),
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no entry"),
            Self::CorruptManifest(e) => write!(f, "corrupt manifest: {}", e),
            Self::KeyMismatch => write!(f, "cache key mismatch"),
            Self::PlatformMismatch { expected, found } => {
                write!(f, "platform mismatch (expected {}, found {})", expected, found)
            }
            Self::RuntimeMismatch { expected, found } => {
                write!(f, "runtime mismatch (expected {}, found {})", expected, found)
            }
            Self::LockfileMismatch => write!(f, "lockfile changed"),
            Self::MissingOutput(path) => write!(f, "missing output file {}", path),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

/// A usable entry returned by a lookup
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Entry key
    pub key: CacheKey,
    /// Entry directory
    pub dir: EntryDir,
    /// Manifest as read during the lookup
    pub manifest: CacheManifest,
}

/// Result of a lookup
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// Entry found and consistent with the request
    Hit(CacheEntry),
    /// Nothing usable
    Miss(MissReason),
}

impl LookupOutcome {
    /// Whether this is a hit
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// What to store after a task ran
#[derive(Debug, Clone, Copy)]
pub struct StoreRequest<'a> {
    /// Inputs the key is computed from
    pub inputs: &'a CacheKeyInputs,
    /// Package directory the outputs are relative to
    pub source_root: &'a Path,
    /// Output paths relative to `source_root`
    pub outputs: &'a [String],
    /// Captured standard output
    pub stdout: &'a str,
    /// Captured standard error
    pub stderr: &'a str,
    /// Exit code of the task
    pub exit_code: i32,
}

/// Result of a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New entry written
    Stored {
        /// Entry key
        key: CacheKey,
        /// Number of output files
        files: usize,
        /// Bytes of output
        bytes: u64,
    },
    /// An entry with the key already exists (possibly written concurrently)
    AlreadyCached(CacheKey),
    /// Failed executions are never cached
    SkippedFailedTask,
    /// The cache is read-only
    SkippedReadOnly,
}

/// Result of restoring one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoredFile {
    /// Copied into place
    Restored {
        /// Relative path
        path: String,
        /// Bytes copied
        bytes: u64,
    },
    /// Stored copy does not match the recorded hash
    HashMismatch {
        /// Relative path
        path: String,
    },
    /// Copy failed
    Failed {
        /// Relative path
        path: String,
        /// Error message
        error: String,
    },
}

impl RestoredFile {
    /// Whether the file was restored
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }
}

/// Result of restoring an entry
#[derive(Debug, Clone)]
pub struct RestoreResult {
    /// Entry key
    pub key: CacheKey,
    /// Per-file results
    pub files: Vec<RestoredFile>,
    /// Standard output captured when the entry was stored
    pub stdout: String,
    /// Standard error captured when the entry was stored
    pub stderr: String,
    /// Total bytes copied
    pub bytes: u64,
}

impl RestoreResult {
    /// Whether every file was restored
    pub fn is_success(&self) -> bool {
        self.files.iter().all(RestoredFile::is_ok)
    }

    /// Files that were not restored
    pub fn failures(&self) -> impl Iterator<Item = &RestoredFile> {
        self.files.iter().filter(|f| !f.is_ok())
    }
}

/// Shared build-output cache rooted at a directory
#[derive(Debug)]
pub struct SharedCache {
    settings: SharedCacheSettings,
    layout: CacheLayout,
    stats: StatisticsContext,
}

impl SharedCache {
    /// Open (and initialize if needed) the cache described by `settings`
    #[instrument(skip_all, fields(root = %settings.root.display()))]
    pub fn open(settings: SharedCacheSettings, stats: StatisticsContext) -> Result<Self> {
        let layout = CacheLayout::new(&settings.root);
        layout.ensure()?;
        debug!(
            read_only = settings.read_only,
            verify = settings.verify_integrity,
            "shared cache opened"
        );
        Ok(Self {
            settings,
            layout,
            stats,
        })
    }

    /// Open with statistics loaded from the cache's own statistics file
    pub fn open_with_persisted_stats(settings: SharedCacheSettings) -> Result<Self> {
        let stats = StatisticsContext::load(CacheLayout::new(&settings.root).statistics_path());
        Self::open(settings, stats)
    }

    /// Effective settings
    pub fn settings(&self) -> &SharedCacheSettings {
        &self.settings
    }

    /// Directory layout
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Statistics context shared with this cache
    pub fn statistics_context(&self) -> &StatisticsContext {
        &self.stats
    }

    /// Copy of the current statistics
    pub fn statistics(&self) -> CacheStatistics {
        self.stats.snapshot()
    }

    /// Persist statistics, logging failures; read-only caches keep them in memory
    pub fn flush_statistics(&self) {
        if self.settings.read_only {
            return;
        }
        self.stats.save_best_effort();
    }

    /// Look up the entry for `inputs`
    #[instrument(skip_all, fields(package = %inputs.package_name, task = %inputs.task_name))]
    pub fn lookup(&self, inputs: &CacheKeyInputs) -> LookupOutcome {
        let key = compute_cache_key(inputs);
        let outcome = self.lookup_key(&key, inputs);

        match &outcome {
            LookupOutcome::Hit(_) => {
                self.stats.update(|s| s.record_hit());
                debug!(key = %key.short(), "shared cache hit");
            }
            LookupOutcome::Miss(reason) => {
                self.stats.update(|s| s.record_miss());
                debug!(key = %key.short(), reason = %reason, "shared cache miss");
            }
        }
        outcome
    }

    fn lookup_key(&self, key: &CacheKey, inputs: &CacheKeyInputs) -> LookupOutcome {
        let dir = self.layout.entry_dir(key);
        let manifest_path = dir.manifest_path();
        if !manifest_path.exists() {
            return LookupOutcome::Miss(MissReason::NotFound);
        }

        let manifest = match read_manifest(&manifest_path) {
            Ok(m) => m,
            Err(CacheError::Io { source, .. }) => {
                return LookupOutcome::Miss(if source.kind() == std::io::ErrorKind::NotFound {
                    MissReason::NotFound
                } else {
                    MissReason::Io(source.to_string())
                })
            }
            Err(e) => return LookupOutcome::Miss(MissReason::CorruptManifest(e.to_string())),
        };

        if let Some(reason) = compare_manifest(key, inputs, &manifest) {
            return LookupOutcome::Miss(reason);
        }

        for file in &manifest.output_files {
            if !dir.file_path(&file.path).is_file() {
                return LookupOutcome::Miss(MissReason::MissingOutput(file.path.clone()));
            }
        }

        if self.settings.read_only {
            return LookupOutcome::Hit(CacheEntry {
                key: key.clone(),
                dir,
                manifest,
            });
        }

        // Access time feeds pruning only; a failed touch keeps the hit
        let manifest = match touch_manifest(&manifest_path, Utc::now()) {
            Ok(touched) => touched,
            Err(e) => {
                warn!(key = %key.short(), error = %e, "failed to update cache entry access time");
                manifest
            }
        };

        LookupOutcome::Hit(CacheEntry {
            key: key.clone(),
            dir,
            manifest,
        })
    }

    /// Store a task's outputs
    #[instrument(skip_all, fields(package = %request.inputs.package_name, task = %request.inputs.task_name))]
    pub fn store(&self, request: StoreRequest<'_>) -> Result<StoreOutcome> {
        if request.exit_code != 0 {
            debug!(exit_code = request.exit_code, "not caching failed execution");
            return Ok(StoreOutcome::SkippedFailedTask);
        }
        if self.settings.read_only {
            debug!("cache is read-only, skipping store");
            return Ok(StoreOutcome::SkippedReadOnly);
        }

        let started = Instant::now();
        let key = compute_cache_key(request.inputs);
        let final_dir = self.layout.entry_dir(&key);
        if final_dir.manifest_path().exists() {
            debug!(key = %key.short(), "entry already cached");
            return Ok(StoreOutcome::AlreadyCached(key));
        }

        let outputs: BTreeSet<&str> = request.outputs.iter().map(String::as_str).collect();
        let staging = StagingDir::new_in(&self.layout.entries_dir())?;
        let staged = EntryDir::new(staging.path());

        let mut records = Vec::with_capacity(outputs.len());
        for relative in outputs {
            if !is_safe_relative_path(relative) {
                return Err(CacheError::UnsafePath(relative.to_string()));
            }
            let src = request.source_root.join(relative);
            let dst = staged.file_path(relative);
            copy_file(&src, &dst).at(&src)?;
            // Hash the stored copy so the record describes exactly what is cached
            let (hash, size) = hash_file_with_size(&dst).at(&dst)?;
            let binary = is_binary_file(&dst).at(&dst)?;
            records.push(OutputFileRecord {
                path: relative.to_string(),
                hash,
                size,
                binary,
            });
        }

        let now = Utc::now();
        let manifest = CacheManifest {
            version: MANIFEST_VERSION,
            cache_key: key.to_string(),
            inputs: request.inputs.clone(),
            exit_code: 0,
            output_files: records,
            stdout: request.stdout.to_string(),
            stderr: request.stderr.to_string(),
            created_at: now,
            last_accessed_at: now,
        };
        write_manifest(&staged.manifest_path(), &manifest)?;

        let files = manifest.output_files.len();
        let bytes = manifest.total_size();
        match staging.publish(final_dir.path())? {
            PublishOutcome::Published => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.stats.update(|s| s.record_store(elapsed_ms, bytes));
                self.flush_statistics();
                info!(key = %key.short(), files, bytes, "stored cache entry");
                Ok(StoreOutcome::Stored { key, files, bytes })
            }
            PublishOutcome::AlreadyPresent => {
                debug!(key = %key.short(), "entry published concurrently by another writer");
                Ok(StoreOutcome::AlreadyCached(key))
            }
        }
    }

    /// Copy an entry's outputs into `target_root`.
    ///
    /// With integrity verification enabled, every stored file is re-hashed
    /// first and mismatching files are not copied.
    #[instrument(skip_all, fields(key = %entry.key.short(), target = %target_root.display()))]
    pub fn restore(&self, entry: &CacheEntry, target_root: &Path) -> RestoreResult {
        let started = Instant::now();
        let verify = self.settings.verify_integrity;
        let mut files = Vec::with_capacity(entry.manifest.output_files.len());
        let mut bytes = 0;

        for record in &entry.manifest.output_files {
            let src = entry.dir.file_path(&record.path);
            let dst: PathBuf = target_root.join(&record.path);

            if verify {
                match hash_file_with_size(&src) {
                    Ok((hash, _)) if hash == record.hash => {}
                    Ok(_) => {
                        warn!(path = %record.path, "cached file failed integrity check");
                        files.push(RestoredFile::HashMismatch {
                            path: record.path.clone(),
                        });
                        continue;
                    }
                    Err(e) => {
                        files.push(RestoredFile::Failed {
                            path: record.path.clone(),
                            error: e.to_string(),
                        });
                        continue;
                    }
                }
            }

            match copy_file(&src, &dst) {
                Ok(copied) => {
                    bytes += copied;
                    files.push(RestoredFile::Restored {
                        path: record.path.clone(),
                        bytes: copied,
                    });
                }
                Err(e) => {
                    warn!(path = %record.path, error = %e, "failed to restore cached file");
                    files.push(RestoredFile::Failed {
                        path: record.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let result = RestoreResult {
            key: entry.key.clone(),
            files,
            stdout: entry.manifest.stdout.clone(),
            stderr: entry.manifest.stderr.clone(),
            bytes,
        };

        if result.is_success() {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.stats.update(|s| s.record_restore(elapsed_ms));
            self.flush_statistics();
            debug!(files = result.files.len(), bytes, "restored cache entry");
        }
        result
    }
}

/// Check a manifest against the request that looked it up
fn compare_manifest(
    key: &CacheKey,
    inputs: &CacheKeyInputs,
    manifest: &CacheManifest,
) -> Option<MissReason> {
    if manifest.cache_key != key.as_str() {
        return Some(MissReason::KeyMismatch);
    }

    let recorded = &manifest.inputs;
    if recorded.environment.platform != inputs.environment.platform {
        return Some(MissReason::PlatformMismatch {
            expected: inputs.environment.platform.clone(),
            found: recorded.environment.platform.clone(),
        });
    }
    if recorded.environment.runtime_version != inputs.environment.runtime_version {
        return Some(MissReason::RuntimeMismatch {
            expected: inputs.environment.runtime_version.clone(),
            found: recorded.environment.runtime_version.clone(),
        });
    }
    if recorded.lockfile_hash != inputs.lockfile_hash {
        return Some(MissReason::LockfileMismatch);
    }

    // Anything else differing means the key was not derived from these inputs
    if compute_cache_key(recorded) != *key {
        return Some(MissReason::KeyMismatch);
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::environment::EnvironmentFingerprint;
    use crate::fileops::hash_bytes;
    use crate::manifest::write_manifest;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn open_cache(root: &Path) -> SharedCache {
        SharedCache::open(
            SharedCacheSettings::new(root.join("cache")),
            StatisticsContext::in_memory(),
        )
        .unwrap()
    }

    pub(crate) fn inputs_for(name: &str, lockfile: &str) -> CacheKeyInputs {
        CacheKeyInputs::new(
            name,
            "build",
            "tsc",
            EnvironmentFingerprint::new("linux-x86_64", "v20.11.0"),
            lockfile,
        )
        .with_input("src/index.ts", hash_bytes(name.as_bytes()))
        .with_output("dist/index.js")
    }

    pub(crate) fn store_simple(cache: &SharedCache, pkg: &Path, inputs: &CacheKeyInputs, content: &str) -> StoreOutcome {
        fs::create_dir_all(pkg.join("dist")).unwrap();
        fs::write(pkg.join("dist/index.js"), content).unwrap();
        let outputs = vec!["dist/index.js".to_string()];
        cache
            .store(StoreRequest {
                inputs,
                source_root: pkg,
                outputs: &outputs,
                stdout: "compiled\n",
                stderr: "",
                exit_code: 0,
            })
            .unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        assert!(cache.layout().entries_dir().is_dir());
        assert!(cache.layout().metadata_path().is_file());
    }

    #[test]
    fn test_store_then_restore_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");

        let outcome = store_simple(&cache, &pkg, &inputs, "console.log(1);\n");
        assert!(matches!(outcome, StoreOutcome::Stored { files: 1, .. }));

        let LookupOutcome::Hit(entry) = cache.lookup(&inputs) else {
            panic!("expected a hit");
        };
        assert_eq!(entry.manifest.stdout, "compiled\n");

        let target = temp.path().join("restored");
        let result = cache.restore(&entry, &target);
        assert!(result.is_success());
        assert_eq!(result.stdout, "compiled\n");
        assert_eq!(
            fs::read_to_string(target.join("dist/index.js")).unwrap(),
            "console.log(1);\n"
        );

        let stats = cache.statistics();
        assert_eq!(stats.store_count, 1);
        assert_eq!(stats.restore_count, 1);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.total_entries, 1);
    }

    #[test]
    fn test_store_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");

        let first = store_simple(&cache, &pkg, &inputs, "first");
        let StoreOutcome::Stored { key, .. } = first else {
            panic!("expected a store");
        };

        // Different bytes under the same key leave the original untouched
        let second = store_simple(&cache, &pkg, &inputs, "second");
        assert_eq!(second, StoreOutcome::AlreadyCached(key.clone()));

        let entry = cache.layout().entry_dir(&key);
        assert_eq!(fs::read_to_string(entry.file_path("dist/index.js")).unwrap(), "first");
        assert_eq!(cache.statistics().store_count, 1);
    }

    #[test]
    fn test_failed_and_read_only_stores_are_skipped() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let inputs = inputs_for("app", "lock");
        let request = StoreRequest {
            inputs: &inputs,
            source_root: temp.path(),
            outputs: &[],
            stdout: "",
            stderr: "boom",
            exit_code: 2,
        };
        assert_eq!(cache.store(request).unwrap(), StoreOutcome::SkippedFailedTask);

        let mut settings = SharedCacheSettings::new(temp.path().join("cache"));
        settings.read_only = true;
        let read_only = SharedCache::open(settings, StatisticsContext::in_memory()).unwrap();
        let request = StoreRequest {
            exit_code: 0,
            ..request
        };
        assert_eq!(read_only.store(request).unwrap(), StoreOutcome::SkippedReadOnly);
        assert_eq!(fs::read_dir(read_only.layout().entries_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_read_only_hit_leaves_cache_untouched() {
        let temp = TempDir::new().unwrap();
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");
        let StoreOutcome::Stored { key, .. } = store_simple(&open_cache(temp.path()), &pkg, &inputs, "out")
        else {
            panic!("expected a store");
        };

        let mut settings = SharedCacheSettings::new(temp.path().join("cache"));
        settings.read_only = true;
        let stats_path = CacheLayout::new(&settings.root).statistics_path();
        let cache = SharedCache::open(settings, StatisticsContext::load(stats_path.clone())).unwrap();

        let manifest = cache.layout().entry_dir(&key).manifest_path();
        let manifest_path = manifest.as_path();
        let bytes_before = fs::read(manifest_path).unwrap();
        let mtime_before = fs::metadata(manifest_path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let LookupOutcome::Hit(entry) = cache.lookup(&inputs) else {
            panic!("expected a hit");
        };
        assert!(cache.restore(&entry, &temp.path().join("restored")).is_success());
        cache.flush_statistics();

        assert_eq!(fs::read(manifest_path).unwrap(), bytes_before);
        assert_eq!(fs::metadata(manifest_path).unwrap().modified().unwrap(), mtime_before);
        assert!(!stats_path.exists());
        assert_eq!(cache.statistics().hit_count, 1);
    }

    #[test]
    fn test_unsafe_output_path_rejected() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let inputs = inputs_for("app", "lock");
        let outputs = vec!["../secret".to_string()];
        let err = cache
            .store(StoreRequest {
                inputs: &inputs,
                source_root: temp.path(),
                outputs: &outputs,
                stdout: "",
                stderr: "",
                exit_code: 0,
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::UnsafePath(_)));
        // The aborted staging directory is cleaned up
        assert_eq!(fs::read_dir(cache.layout().entries_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_interrupted_store_is_invisible() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let inputs = inputs_for("app", "lock");
        let key = compute_cache_key(&inputs);

        // Everything written, but the process dies before the final rename
        let staging = StagingDir::new_in(&cache.layout().entries_dir()).unwrap();
        let staged = EntryDir::new(staging.path());
        fs::create_dir_all(staged.files_dir().join("dist")).unwrap();
        fs::write(staged.file_path("dist/index.js"), "partial").unwrap();
        let now = Utc::now();
        let manifest = CacheManifest {
            version: MANIFEST_VERSION,
            cache_key: key.to_string(),
            inputs: inputs.clone(),
            exit_code: 0,
            output_files: vec![OutputFileRecord {
                path: "dist/index.js".to_string(),
                hash: hash_bytes(b"partial"),
                size: 7,
                binary: false,
            }],
            stdout: String::new(),
            stderr: String::new(),
            created_at: now,
            last_accessed_at: now,
        };
        write_manifest(&staged.manifest_path(), &manifest).unwrap();
        let leftover = staging.abandon();

        assert!(leftover.exists());
        assert_eq!(
            match cache.lookup(&inputs) {
                LookupOutcome::Miss(reason) => reason,
                LookupOutcome::Hit(_) => panic!("partial entry must not be visible"),
            },
            MissReason::NotFound
        );
    }

    #[test]
    fn test_corrupt_manifest_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");
        store_simple(&cache, &pkg, &inputs, "x");

        let dir = cache.layout().entry_dir(&compute_cache_key(&inputs));
        fs::write(dir.manifest_path().as_path(), "{\"version\": 1, \"truncated").unwrap();

        assert!(matches!(
            cache.lookup(&inputs),
            LookupOutcome::Miss(MissReason::CorruptManifest(_))
        ));
        // Lookups never delete
        assert!(dir.path().exists());
    }

    #[test]
    fn test_missing_output_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");
        store_simple(&cache, &pkg, &inputs, "x");

        let dir = cache.layout().entry_dir(&compute_cache_key(&inputs));
        fs::remove_file(dir.file_path("dist/index.js")).unwrap();

        assert_eq!(
            match cache.lookup(&inputs) {
                LookupOutcome::Miss(reason) => reason,
                LookupOutcome::Hit(_) => panic!("expected a miss"),
            },
            MissReason::MissingOutput("dist/index.js".to_string())
        );
    }

    #[test]
    fn test_lockfile_change_invalidates_every_entry() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());

        let names = ["a", "b", "c", "d"];
        for name in names {
            let pkg = temp.path().join(name);
            store_simple(&cache, &pkg, &inputs_for(name, "lock-v1"), name);
        }
        for name in names {
            assert!(cache.lookup(&inputs_for(name, "lock-v1")).is_hit());
        }

        for name in names {
            assert!(!cache.lookup(&inputs_for(name, "lock-v2")).is_hit());
        }
        let stats = cache.statistics();
        assert_eq!(stats.hit_count, 4);
        assert_eq!(stats.miss_count, 4);
    }

    #[test]
    fn test_environment_mismatch_reasons() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");
        store_simple(&cache, &pkg, &inputs, "x");
        let key = compute_cache_key(&inputs);

        let mut other = inputs.clone();
        other.environment.platform = "darwin-aarch64".to_string();
        assert!(matches!(
            compare_manifest(&key, &other, &cache.lookup_key_manifest(&key)),
            Some(MissReason::PlatformMismatch { .. })
        ));

        let mut other = inputs.clone();
        other.environment.runtime_version = "v22.0.0".to_string();
        assert!(matches!(
            compare_manifest(&key, &other, &cache.lookup_key_manifest(&key)),
            Some(MissReason::RuntimeMismatch { .. })
        ));

        let mut other = inputs.clone();
        other.lockfile_hash = "changed".to_string();
        assert_eq!(
            compare_manifest(&key, &other, &cache.lookup_key_manifest(&key)),
            Some(MissReason::LockfileMismatch)
        );

        assert_eq!(compare_manifest(&key, &inputs, &cache.lookup_key_manifest(&key)), None);
    }

    #[test]
    fn test_verified_restore_detects_tampering() {
        let temp = TempDir::new().unwrap();
        let mut settings = SharedCacheSettings::new(temp.path().join("cache"));
        settings.verify_integrity = true;
        let cache = SharedCache::open(settings, StatisticsContext::in_memory()).unwrap();
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");
        store_simple(&cache, &pkg, &inputs, "original");

        let LookupOutcome::Hit(entry) = cache.lookup(&inputs) else {
            panic!("expected a hit");
        };
        fs::write(entry.dir.file_path("dist/index.js"), "tampered").unwrap();

        let target = temp.path().join("out");
        let result = cache.restore(&entry, &target);
        assert!(!result.is_success());
        assert_eq!(
            result.failures().cloned().collect::<Vec<_>>(),
            vec![RestoredFile::HashMismatch {
                path: "dist/index.js".to_string()
            }]
        );
        assert!(!target.join("dist/index.js").exists());
        assert_eq!(cache.statistics().restore_count, 0);
    }

    #[test]
    fn test_hit_updates_last_accessed() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path());
        let pkg = temp.path().join("pkg");
        let inputs = inputs_for("app", "lock");
        store_simple(&cache, &pkg, &inputs, "x");

        let dir = cache.layout().entry_dir(&compute_cache_key(&inputs));
        let mut manifest = read_manifest(&dir.manifest_path()).unwrap();
        let old = manifest.created_at - chrono::Duration::days(3);
        manifest.last_accessed_at = old;
        write_manifest(&dir.manifest_path(), &manifest).unwrap();

        let LookupOutcome::Hit(entry) = cache.lookup(&inputs) else {
            panic!("expected a hit");
        };
        assert!(entry.manifest.last_accessed_at > old);
        assert!(read_manifest(&dir.manifest_path()).unwrap().last_accessed_at > old);
    }

    impl SharedCache {
        fn lookup_key_manifest(&self, key: &CacheKey) -> CacheManifest {
            read_manifest(&self.layout.entry_dir(key).manifest_path()).unwrap()
        }
    }
}
