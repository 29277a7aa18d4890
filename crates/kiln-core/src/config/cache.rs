//! Shared cache settings resolution
//!
//! Precedence, highest first: command-line flags, the `KILN_CACHE_DIR`
//! environment variable, the repository config file, built-in defaults.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::defaults::CACHE_DIR_ENV;
use super::types::SharedCacheConfig;

/// Cache settings supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct CacheOverrides {
    /// Cache directory flag
    pub dir: Option<PathBuf>,
    /// Force read-only mode
    pub read_only: bool,
    /// Force integrity verification on restore
    pub verify_integrity: bool,
}

/// Fully resolved shared cache settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCacheSettings {
    /// Cache root directory
    pub root: PathBuf,
    /// Skip all writes
    pub read_only: bool,
    /// Re-hash outputs before restoring them
    pub verify_integrity: bool,
    /// Prune size threshold
    pub max_size_mb: u64,
    /// Prune age threshold
    pub max_age_days: u64,
    /// Prune after each run
    pub auto_prune: bool,
}

impl SharedCacheSettings {
    /// Settings for a cache rooted at `root` with default thresholds
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let defaults = SharedCacheConfig::default();
        Self {
            root: root.into(),
            read_only: defaults.read_only,
            verify_integrity: defaults.verify_integrity,
            max_size_mb: defaults.max_size_mb,
            max_age_days: defaults.max_age_days,
            auto_prune: defaults.auto_prune,
        }
    }

    /// Size threshold in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

impl SharedCacheConfig {
    /// Resolve the effective settings.
    ///
    /// `env_dir` is the value of the cache directory environment variable and
    /// `base_dir` anchors relative paths (the directory holding the config file).
    /// Returns `None` when no cache directory is configured anywhere.
    pub fn resolve(
        &self,
        overrides: &CacheOverrides,
        env_dir: Option<&str>,
        base_dir: &Path,
    ) -> Option<SharedCacheSettings> {
        let env_dir = env_dir.map(str::trim).filter(|d| !d.is_empty());

        let (root, source) = if let Some(dir) = &overrides.dir {
            (dir.clone(), "flag")
        } else if let Some(dir) = env_dir {
            (PathBuf::from(dir), CACHE_DIR_ENV)
        } else if let Some(dir) = &self.dir {
            (dir.clone(), "config")
        } else {
            debug!("no shared cache directory configured");
            return None;
        };

        let root = if root.is_absolute() {
            root
        } else {
            base_dir.join(root)
        };
        debug!(root = %root.display(), source, "shared cache directory resolved");

        Some(SharedCacheSettings {
            root,
            read_only: overrides.read_only || self.read_only,
            verify_integrity: overrides.verify_integrity || self.verify_integrity,
            max_size_mb: self.max_size_mb,
            max_age_days: self.max_age_days,
            auto_prune: self.auto_prune,
        })
    }

    /// Resolve using the process environment
    pub fn resolve_from_env(
        &self,
        overrides: &CacheOverrides,
        base_dir: &Path,
    ) -> Option<SharedCacheSettings> {
        let env_dir = std::env::var(CACHE_DIR_ENV).ok();
        self.resolve(overrides, env_dir.as_deref(), base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_directory() {
        let config = SharedCacheConfig::default();
        let resolved = config.resolve(&CacheOverrides::default(), None, Path::new("/repo"));
        assert!(resolved.is_none());
    }

    #[test]
    fn test_flag_beats_env_and_config() {
        let config = SharedCacheConfig {
            dir: Some(PathBuf::from("from-config")),
            ..Default::default()
        };
        let overrides = CacheOverrides {
            dir: Some(PathBuf::from("/flag/cache")),
            ..Default::default()
        };

        let resolved = config
            .resolve(&overrides, Some("/env/cache"), Path::new("/repo"))
            .unwrap();
        assert_eq!(resolved.root, PathBuf::from("/flag/cache"));
    }

    #[test]
    fn test_env_beats_config() {
        let config = SharedCacheConfig {
            dir: Some(PathBuf::from("from-config")),
            ..Default::default()
        };

        let resolved = config
            .resolve(&CacheOverrides::default(), Some("/env/cache"), Path::new("/repo"))
            .unwrap();
        assert_eq!(resolved.root, PathBuf::from("/env/cache"));
    }

    #[test]
    fn test_config_relative_to_base() {
        let config = SharedCacheConfig {
            dir: Some(PathBuf::from(".cache/kiln")),
            read_only: true,
            ..Default::default()
        };

        let resolved = config
            .resolve(&CacheOverrides::default(), Some("  "), Path::new("/repo"))
            .unwrap();
        assert_eq!(resolved.root, PathBuf::from("/repo/.cache/kiln"));
        assert!(resolved.read_only);
    }

    #[test]
    fn test_flags_force_modes() {
        let config = SharedCacheConfig {
            dir: Some(PathBuf::from("/cache")),
            ..Default::default()
        };
        let overrides = CacheOverrides {
            dir: None,
            read_only: true,
            verify_integrity: true,
        };

        let resolved = config.resolve(&overrides, None, Path::new("/repo")).unwrap();
        assert!(resolved.read_only);
        assert!(resolved.verify_integrity);
        assert_eq!(resolved.max_size_bytes(), 5 * 1024 * 1024 * 1024);
    }
}
