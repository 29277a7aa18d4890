//! Atomic publication of files and directories.
//!
//! Everything is first written under a unique temporary name inside the
//! destination directory and then renamed into place. A rename within one
//! directory is atomic, so readers in other processes see either nothing or
//! the finished artifact, never a partial one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;

use crate::error::{IoResultExt, Result};

/// Prefix of in-flight staging directories; entries with a leading dot are
/// never treated as cache entries
pub const STAGING_PREFIX: &str = ".staging-";

/// Prefix used when an entry is moved aside before deletion
pub const TRASH_PREFIX: &str = ".trash-";

/// Atomically replace `path` with `bytes`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).at(path)
}

/// Outcome of publishing a staged directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The staged directory now lives at the destination
    Published,
    /// Another writer published the destination first; the staged copy was discarded
    AlreadyPresent,
}

/// A uniquely named directory next to its final destination.
///
/// Dropping it without calling [`StagingDir::publish`] removes it.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    /// Create a staging directory inside `parent`
    pub fn new_in(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent).at(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)
            .at(parent)?;
        Ok(Self { dir })
    }

    /// Path of the staging directory
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Rename the staging directory to `dest`.
    ///
    /// When `dest` already exists the rename fails and the staged copy is
    /// dropped; content addressing makes the existing copy equivalent.
    pub fn publish(self, dest: &Path) -> Result<PublishOutcome> {
        match fs::rename(self.dir.path(), dest) {
            Ok(()) => {
                // Nothing left at the old path; the TempDir drop is a no-op
                drop(self.dir);
                Ok(PublishOutcome::Published)
            }
            Err(_) if dest.exists() => Ok(PublishOutcome::AlreadyPresent),
            Err(e) => Err(e).at(dest),
        }
    }

    /// Leave the staging directory on disk, as a killed process would
    #[cfg(test)]
    pub(crate) fn abandon(self) -> PathBuf {
        self.dir.into_path()
    }
}

/// Move `dir` aside under a unique name, then delete it.
///
/// Returns `Ok(false)` when the directory was already gone, for example
/// because another process removed it first.
pub fn remove_dir_atomic(dir: &Path) -> Result<bool> {
    let Some(parent) = dir.parent() else {
        fs::remove_dir_all(dir).at(dir)?;
        return Ok(true);
    };

    let trash = unique_sibling(parent, dir);
    match fs::rename(dir, &trash) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).at(dir),
    }
    fs::remove_dir_all(&trash).at(&trash)?;
    Ok(true)
}

fn unique_sibling(parent: &Path, dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    parent.join(format!(
        "{}{}-{}-{}",
        TRASH_PREFIX,
        name,
        std::process::id(),
        nanos
    ))
}
