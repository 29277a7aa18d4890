//! Output-set detection for cacheable tasks

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{CacheError, IoResultExt, Result};
use crate::fileops::relative_path_string;

/// Directories never considered part of a task's inputs or outputs
pub const IGNORED_DIRS: &[&str] = &["node_modules", ".git", ".kiln"];

/// How a task's outputs are found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDetection {
    /// Files matching any of the glob patterns after the task ran
    Patterns(Vec<String>),
    /// Exact relative paths, kept when they exist after the task ran
    Paths(Vec<String>),
    /// Files created or modified while the task ran
    SnapshotDiff,
    /// Snapshot diff, restricted to files matching the patterns
    Hybrid(Vec<String>),
}

impl OutputDetection {
    fn needs_snapshot(&self) -> bool {
        matches!(self, Self::SnapshotDiff | Self::Hybrid(_))
    }

    fn patterns(&self) -> &[String] {
        match self {
            Self::Patterns(p) | Self::Hybrid(p) => p,
            Self::Paths(_) | Self::SnapshotDiff => &[],
        }
    }
}

/// Build a matcher from glob patterns
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| CacheError::InvalidPattern {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Relative paths of every regular file under `root`, skipping ignored
/// directories, sorted
pub fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_ignored(e)) {
        let entry = entry.map_err(|e| CacheError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            if let Some(relative) = relative_path_string(entry.path(), root) {
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Relative paths under `root` matching any of `patterns`, sorted
pub fn expand_patterns(root: &Path, patterns: &[String]) -> Result<Vec<String>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let matcher = build_globset(patterns)?;
    Ok(walk_files(root)?
        .into_iter()
        .filter(|path| matcher.is_match(path))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    size: u64,
    modified: Option<SystemTime>,
}

/// File sizes and modification times under a directory at one point in time
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: BTreeMap<String, FileState>,
}

impl Snapshot {
    /// Record every file under `root`
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        for relative in walk_files(root)? {
            let path = root.join(&relative);
            let metadata = std::fs::metadata(&path).at(&path)?;
            files.insert(
                relative,
                FileState {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            );
        }
        Ok(Self { files })
    }

    /// Number of files recorded
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no files were recorded
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths that are new in `after` or whose size or mtime changed
    pub fn changed_since<'a>(&self, after: &'a Snapshot) -> Vec<&'a str> {
        after
            .files
            .iter()
            .filter(|(path, state)| self.files.get(*path) != Some(*state))
            .map(|(path, _)| path.as_str())
            .collect()
    }
}

/// Finds the files a task produced, relative to the package directory
#[derive(Debug)]
pub struct OutputDetector {
    strategy: OutputDetection,
    root: PathBuf,
    before: Option<Snapshot>,
}

impl OutputDetector {
    /// Create a detector for a package directory
    pub fn new(strategy: OutputDetection, root: impl Into<PathBuf>) -> Self {
        Self {
            strategy,
            root: root.into(),
            before: None,
        }
    }

    /// The detection strategy
    pub fn strategy(&self) -> &OutputDetection {
        &self.strategy
    }

    /// Take the "before" snapshot; a no-op for pattern detection
    pub fn before_execution(&mut self) -> Result<()> {
        if self.strategy.needs_snapshot() {
            let snapshot = Snapshot::capture(&self.root)?;
            debug!(root = %self.root.display(), files = snapshot.len(), "captured pre-execution snapshot");
            self.before = Some(snapshot);
        }
        Ok(())
    }

    /// Detect outputs after the task ran; sorted relative paths
    pub fn detect(&self) -> Result<Vec<String>> {
        let outputs = match &self.strategy {
            OutputDetection::Patterns(patterns) => expand_patterns(&self.root, patterns)?,
            OutputDetection::Paths(paths) => {
                let mut existing: Vec<String> = paths
                    .iter()
                    .filter(|p| self.root.join(p).is_file())
                    .cloned()
                    .collect();
                existing.sort();
                existing.dedup();
                existing
            }
            OutputDetection::SnapshotDiff | OutputDetection::Hybrid(_) => {
                let before = self.before.clone().unwrap_or_default();
                let after = Snapshot::capture(&self.root)?;
                let changed = before.changed_since(&after);

                let patterns = self.strategy.patterns();
                if patterns.is_empty() {
                    changed.into_iter().map(str::to_string).collect()
                } else {
                    let matcher = build_globset(patterns)?;
                    changed
                        .into_iter()
                        .filter(|p| matcher.is_match(p))
                        .map(str::to_string)
                        .collect()
                }
            }
        };

        debug!(root = %self.root.display(), outputs = outputs.len(), "detected outputs");
        Ok(outputs)
    }
}
