//! On-disk layout of the cache root

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atomic::write_json_atomic;
use crate::error::{CacheError, IoResultExt, Result};
use crate::key::CacheKey;
use crate::manifest::EntryDir;

/// Versioned subdirectory; a layout change gets a new one
pub const LAYOUT_DIR: &str = "v1";

/// Schema version written to `metadata.json`
pub const LAYOUT_SCHEMA_VERSION: u32 = 1;

/// Contents of `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Layout schema version
    pub schema_version: u32,
    /// When the cache directory was initialized
    pub created_at: DateTime<Utc>,
}

/// Paths inside a cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    base: PathBuf,
}

impl CacheLayout {
    /// Layout for a cache root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base = root.join(LAYOUT_DIR);
        Self { root, base }
    }

    /// Configured cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/v1`
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// `<root>/v1/entries`
    pub fn entries_dir(&self) -> PathBuf {
        self.base.join("entries")
    }

    /// Directory of the entry stored under `key`
    pub fn entry_dir(&self, key: &CacheKey) -> EntryDir {
        EntryDir::new(self.entries_dir().join(key.as_str()))
    }

    /// `<root>/v1/statistics.json`
    pub fn statistics_path(&self) -> PathBuf {
        self.base.join("statistics.json")
    }

    /// `<root>/v1/metadata.json`
    pub fn metadata_path(&self) -> PathBuf {
        self.base.join("metadata.json")
    }

    /// Create the directory structure and metadata file if missing
    pub fn ensure(&self) -> Result<()> {
        if self.root.exists() && !self.root.is_dir() {
            return Err(CacheError::InvalidRoot {
                path: self.root.clone(),
                reason: "path exists and is not a directory".to_string(),
            });
        }

        let entries = self.entries_dir();
        std::fs::create_dir_all(&entries).map_err(|e| CacheError::InvalidRoot {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;

        let metadata_path = self.metadata_path();
        if !metadata_path.exists() {
            let metadata = CacheMetadata {
                schema_version: LAYOUT_SCHEMA_VERSION,
                created_at: Utc::now(),
            };
            write_json_atomic(&metadata_path, &metadata)?;
            info!(root = %self.root.display(), "initialized cache directory");
        }

        Ok(())
    }

    /// Read `metadata.json`
    pub fn read_metadata(&self) -> Result<CacheMetadata> {
        let path = self.metadata_path();
        let bytes = std::fs::read(&path).at(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = CacheLayout::new("/cache");
        assert_eq!(layout.entries_dir(), PathBuf::from("/cache/v1/entries"));
        assert_eq!(layout.statistics_path(), PathBuf::from("/cache/v1/statistics.json"));
        assert_eq!(layout.metadata_path(), PathBuf::from("/cache/v1/metadata.json"));

        let key = CacheKey::parse(&"a".repeat(64)).unwrap();
        assert_eq!(
            layout.entry_dir(&key).manifest_path().as_path(),
            Path::new("/cache/v1/entries").join("a".repeat(64)).join("manifest.json")
        );
    }

    #[test]
    fn test_ensure_creates_structure_once() {
        let temp = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp.path().join("cache"));

        layout.ensure().unwrap();
        assert!(layout.entries_dir().is_dir());
        let first = layout.read_metadata().unwrap();
        assert_eq!(first.schema_version, LAYOUT_SCHEMA_VERSION);

        layout.ensure().unwrap();
        assert_eq!(layout.read_metadata().unwrap(), first);
    }

    #[test]
    fn test_root_that_is_a_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("cache");
        std::fs::write(&file, "").unwrap();

        let err = CacheLayout::new(&file).ensure().unwrap_err();
        assert!(matches!(err, CacheError::InvalidRoot { .. }));
    }
}
