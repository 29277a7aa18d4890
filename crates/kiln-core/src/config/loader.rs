//! Configuration loading

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::{config_file_names, PACKAGE_CONFIG_FILE};
use super::types::{Config, PackageTasksConfig};
use super::validation::{validate_config, validate_package_config};

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// The first match wins. Parents are walked until the filesystem root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration or use defaults.
///
/// A missing file falls back to defaults; a file that exists but does not
/// parse or validate is an error.
pub fn load_config_or_default(dir: &Path) -> Result<(Config, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

/// Load the per-package task overrides from `<package_dir>/kiln.toml`.
///
/// Overrides live under the `[package.tasks]` table so the same file can also
/// act as the repository config for single-package repositories.
pub fn load_package_config(package_dir: &Path) -> Result<PackageTasksConfig> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct PackageFile {
        package: PackageTasksConfig,
    }

    let path = package_dir.join(PACKAGE_CONFIG_FILE);
    if !path.exists() {
        return Ok(PackageTasksConfig::default());
    }

    debug!(path = %path.display(), "loading package task overrides");
    let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
    let file: PackageFile = toml::from_str(&content).map_err(ConfigError::TomlError)?;
    validate_package_config(&file.package, &path)?;
    Ok(file.package)
}
