//! Error types for the shared cache

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by cache operations.
///
/// None of these ever fail a build: the execution engine treats every cache
/// error as a miss and carries on.
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O failure on a specific path
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest failed validation
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Cache root cannot be used
    #[error("Invalid cache directory {path}: {reason}")]
    InvalidRoot {
        /// Configured root
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// Output path is absolute or leaves the package directory
    #[error("Output path escapes the package directory: {0}")]
    UnsafePath(String),

    /// Invalid glob in an output or input pattern
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        /// The pattern
        pattern: String,
        /// Parser message
        message: String,
    },
}

/// Errors found while validating a manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Not valid JSON or a required field is missing or mistyped
    #[error("Malformed manifest: {0}")]
    Malformed(String),

    /// Written by an incompatible schema version
    #[error("Unsupported manifest version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version in the file
        found: u32,
        /// Version this build understands
        expected: u32,
    },

    /// Only successful executions are ever cached
    #[error("Manifest records non-zero exit code {0}")]
    NonZeroExit(i32),

    /// Output path is not a normalized relative path
    #[error("Invalid output path '{0}'")]
    InvalidOutputPath(String),

    /// The same output is listed twice
    #[error("Duplicate output path '{0}'")]
    DuplicateOutputPath(String),

    /// A hash is not 64 lowercase hex characters
    #[error("Invalid hash for '{field}': '{value}'")]
    InvalidHash {
        /// Field or output path the hash belongs to
        field: String,
        /// Offending value
        value: String,
    },
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Attach the failing path to an `io::Result`
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl CacheError {
    /// Whether the underlying cause is a missing file or directory
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
