//! Configuration and cache settings shared by all commands

use std::path::PathBuf;

use anyhow::Context as _;
use tracing::debug;

use kiln_cache::SharedCache;
use kiln_core::config::{load_config_or_default, Config, SharedCacheSettings, CACHE_DIR_ENV};
use kiln_core::{ConfigError, KilnError};

use super::Cli;

/// Loaded configuration for one invocation
#[derive(Debug)]
pub struct Context {
    /// Directory holding the config file, or the working directory without one
    pub root: PathBuf,
    /// Repository configuration
    pub config: Config,
    /// Effective shared cache settings; `None` when no cache directory is set
    pub cache: Option<SharedCacheSettings>,
}

impl Context {
    /// Load configuration from the working directory upwards
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd)?;
        let root = config_path
            .as_deref()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .unwrap_or(cwd);

        let cache = config.cache.resolve_from_env(&cli.cache_overrides(), &root);
        debug!(root = %root.display(), cache = cache.is_some(), "context loaded");

        Ok(Self {
            root,
            config,
            cache,
        })
    }

    /// Open the shared cache for a management command; a missing
    /// configuration is an error here
    pub fn require_cache(&self) -> anyhow::Result<SharedCache> {
        let settings = self.cache.clone().with_context(|| {
            format!(
                "No shared cache configured (use --cache-dir, {} or cache.dir in kiln.toml)",
                CACHE_DIR_ENV
            )
        })?;
        let root = settings.root.clone();
        SharedCache::open_with_persisted_stats(settings)
            .with_context(|| format!("Failed to open cache at {}", root.display()))
    }

    /// Open the shared cache for a build.
    ///
    /// A configured directory that cannot be used is a configuration error;
    /// I/O failures later on only disable caching for the affected task.
    pub fn open_cache_for_build(&self) -> anyhow::Result<Option<SharedCache>> {
        let Some(settings) = self.cache.clone() else {
            return Ok(None);
        };
        let root = settings.root.clone();
        let cache = SharedCache::open_with_persisted_stats(settings).map_err(|e| {
            KilnError::from(ConfigError::InvalidValue {
                field: "cache.dir".to_string(),
                message: format!("{}: {}", root.display(), e),
            })
        })?;
        Ok(Some(cache))
    }
}
