//! Configuration validation

use std::path::Path;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, PipelineEntry, PackageTasksConfig};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_pipeline(config.tasks.pipeline.iter(), "tasks.pipeline")?;
    validate_tasks(config)?;
    validate_cache(config)?;
    debug!("configuration validation passed");
    Ok(())
}

/// Validate per-package task overrides
pub fn validate_package_config(config: &PackageTasksConfig, path: &Path) -> Result<()> {
    let prefix = format!("{}: package.tasks", path.display());
    validate_pipeline(config.tasks.iter(), &prefix)
}

/// Check the syntax of a single task reference.
///
/// Accepted forms: `name`, `^name`, `package#name`, and `...`. When
/// `allow_wildcard` is set, `*` is accepted too (used by `before`/`after`).
pub fn check_task_reference(reference: &str, allow_wildcard: bool) -> std::result::Result<(), String> {
    let valid_name = |s: &str| !s.is_empty() && !s.contains(char::is_whitespace) && !s.contains('#');

    if reference == "..." || (allow_wildcard && reference == "*") {
        return Ok(());
    }

    if let Some(task) = reference.strip_prefix('^') {
        return if valid_name(task) && !task.starts_with('^') {
            Ok(())
        } else {
            Err(format!("'{}' is not a valid '^task' reference", reference))
        };
    }

    if let Some((package, task)) = reference.split_once('#') {
        return if !package.is_empty() && valid_name(task) {
            Ok(())
        } else {
            Err(format!("'{}' is not a valid 'package#task' reference", reference))
        };
    }

    if valid_name(reference) {
        Ok(())
    } else {
        Err(format!("'{}' is not a valid task name", reference))
    }
}

fn validate_pipeline<'a>(
    entries: impl Iterator<Item = (&'a String, &'a PipelineEntry)>,
    prefix: &str,
) -> Result<()> {
    for (name, entry) in entries {
        if name.is_empty() || name.contains('#') || name.starts_with('^') {
            return Err(ConfigError::InvalidValue {
                field: prefix.to_string(),
                message: format!("'{}' is not a valid task name", name),
            }
            .into());
        }

        let task = entry.to_task();
        for (list, allow_wildcard, refs) in [
            ("depends_on", false, &task.depends_on),
            ("before", true, &task.before),
            ("after", true, &task.after),
        ] {
            for reference in refs {
                check_task_reference(reference, allow_wildcard).map_err(|message| {
                    ConfigError::InvalidValue {
                        field: format!("{}.{}.{}", prefix, name, list),
                        message,
                    }
                })?;
            }
        }

        if let Some(command) = &task.command {
            if command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.{}.command", prefix, name),
                    message: "command cannot be empty".to_string(),
                }
                .into());
            }
        }
    }

    Ok(())
}

fn validate_tasks(config: &Config) -> Result<()> {
    if config.tasks.concurrency == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "tasks.concurrency".to_string(),
            message: "concurrency must be at least 1".to_string(),
        }
        .into());
    }
    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    if config.cache.max_size_mb == 0 {
        return Err(ConfigError::InvalidValue {
            field: "cache.max_size_mb".to_string(),
            message: "must be greater than zero".to_string(),
        }
        .into());
    }

    if config.cache.max_age_days == 0 {
        return Err(ConfigError::InvalidValue {
            field: "cache.max_age_days".to_string(),
            message: "must be greater than zero".to_string(),
        }
        .into());
    }

    if let Some(dir) = &config.cache.dir {
        if dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache.dir".to_string(),
                message: "cache directory cannot be empty".to_string(),
            }
            .into());
        }
    }

    Ok(())
}
