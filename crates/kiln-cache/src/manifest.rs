//! Cache entry manifests
//!
//! `EntryDir` and `ManifestPath` are separate types: the only way to obtain a
//! `ManifestPath` is from an `EntryDir`, so the read and write functions can
//! never be handed the entry directory itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_json_atomic;
use crate::error::{IoResultExt, ManifestError, Result};
use crate::fileops::{is_safe_relative_path, is_sha256_hex};
use crate::key::CacheKeyInputs;

/// Current manifest schema version
pub const MANIFEST_VERSION: u32 = 1;

/// File name of the manifest inside an entry directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory holding the mirrored output tree inside an entry
pub const FILES_DIR: &str = "files";

/// Directory of one cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDir(PathBuf);

impl EntryDir {
    /// Wrap an entry directory path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The directory
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// The entry's manifest file
    pub fn manifest_path(&self) -> ManifestPath {
        ManifestPath(self.0.join(MANIFEST_FILE))
    }

    /// Root of the mirrored output tree
    pub fn files_dir(&self) -> PathBuf {
        self.0.join(FILES_DIR)
    }

    /// Stored copy of one output
    pub fn file_path(&self, relative: &str) -> PathBuf {
        self.files_dir().join(relative)
    }
}

/// Path of a `manifest.json` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPath(PathBuf);

impl ManifestPath {
    /// The manifest file path
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Whether the manifest exists on disk
    pub fn exists(&self) -> bool {
        self.0.is_file()
    }
}

/// One cached output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFileRecord {
    /// Path relative to the package directory
    pub path: String,
    /// Hex SHA-256 of the contents
    pub hash: String,
    /// Size in bytes
    pub size: u64,
    /// Whether the file looked binary when it was stored
    #[serde(default)]
    pub binary: bool,
}

/// Metadata of a cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    /// Schema version
    pub version: u32,
    /// Key the entry is stored under
    pub cache_key: String,
    /// Inputs that produced the key
    pub inputs: CacheKeyInputs,
    /// Exit code of the execution; always 0
    pub exit_code: i32,
    /// Output files, sorted by path
    pub output_files: Vec<OutputFileRecord>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Last time a lookup hit this entry
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheManifest {
    /// Sum of all output sizes
    pub fn total_size(&self) -> u64 {
        self.output_files.iter().map(|f| f.size).sum()
    }

    /// Check that a manifest is well formed
    pub fn validate(&self) -> std::result::Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: self.version,
                expected: MANIFEST_VERSION,
            });
        }

        if self.exit_code != 0 {
            return Err(ManifestError::NonZeroExit(self.exit_code));
        }

        if !is_sha256_hex(&self.cache_key) {
            return Err(ManifestError::InvalidHash {
                field: "cacheKey".to_string(),
                value: self.cache_key.clone(),
            });
        }

        let mut seen = HashSet::new();
        for file in &self.output_files {
            if !is_safe_relative_path(&file.path) {
                return Err(ManifestError::InvalidOutputPath(file.path.clone()));
            }
            if !seen.insert(file.path.as_str()) {
                return Err(ManifestError::DuplicateOutputPath(file.path.clone()));
            }
            if !is_sha256_hex(&file.hash) {
                return Err(ManifestError::InvalidHash {
                    field: file.path.clone(),
                    value: file.hash.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Validate and atomically write a manifest
pub fn write_manifest(path: &ManifestPath, manifest: &CacheManifest) -> Result<()> {
    manifest.validate()?;
    write_json_atomic(path.as_path(), manifest)?;
    debug!(path = %path.as_path().display(), key = %manifest.cache_key, "manifest written");
    Ok(())
}

/// Read and validate a manifest
pub fn read_manifest(path: &ManifestPath) -> Result<CacheManifest> {
    let bytes = std::fs::read(path.as_path()).at(path.as_path())?;
    let manifest: CacheManifest =
        serde_json::from_slice(&bytes).map_err(|e| ManifestError::Malformed(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Update `lastAccessedAt` and rewrite the manifest atomically
pub fn touch_manifest(path: &ManifestPath, now: DateTime<Utc>) -> Result<CacheManifest> {
    let mut manifest = read_manifest(path)?;
    manifest.last_accessed_at = now;
    write_manifest(path, &manifest)?;
    Ok(manifest)
}
