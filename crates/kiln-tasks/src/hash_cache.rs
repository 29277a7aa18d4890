//! Per-run memo of file content hashes

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use kiln_cache::fileops::hash_file;

/// Memoizes file hashes for the duration of one run.
///
/// Entries for files a task writes must be invalidated once it finishes.
#[derive(Debug, Default)]
pub struct FileHashCache {
    hashes: Mutex<HashMap<PathBuf, String>>,
}

impl FileHashCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, String>> {
        self.hashes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hash of `path`, computed on first use
    pub fn hash(&self, path: &Path) -> io::Result<String> {
        if let Some(hash) = self.lock().get(path) {
            return Ok(hash.clone());
        }
        // Hash outside the lock; a racing thread computes the same value
        let hash = hash_file(path)?;
        self.lock().insert(path.to_path_buf(), hash.clone());
        Ok(hash)
    }

    /// Forget the given files
    pub fn invalidate<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) {
        let mut hashes = self.lock();
        for path in paths {
            hashes.remove(path);
        }
    }

    /// Number of memoized hashes
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is memoized
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
