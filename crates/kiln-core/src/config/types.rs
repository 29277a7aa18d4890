//! Configuration types

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main Kiln configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Custom workspace layout (used when no package manager workspace is found)
    pub workspace: WorkspaceConfig,

    /// Task pipeline configuration
    pub tasks: TasksConfig,

    /// Shared build-output cache configuration
    pub cache: SharedCacheConfig,

    /// Environment fingerprint configuration
    pub environment: EnvironmentConfig,
}

/// Custom workspace layout
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Glob patterns for package directories; `!` prefixed entries exclude
    pub packages: Vec<String>,

    /// Glob patterns for directories to leave out
    pub exclude: Vec<String>,
}

/// Task orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TasksConfig {
    /// Maximum concurrent tasks (defaults to available parallelism)
    pub concurrency: Option<usize>,

    /// Repository-wide default task definitions
    pub pipeline: BTreeMap<String, PipelineEntry>,
}

/// A pipeline entry, either a bare list of dependency references or a full table
///
/// ```toml
/// [tasks.pipeline]
/// build = ["^build"]
///
/// [tasks.pipeline.test]
/// depends_on = ["build"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineEntry {
    /// Short form: dependency references only
    Dependencies(Vec<String>),
    /// Long form: full task table
    Task(PipelineTask),
}

impl PipelineEntry {
    /// Normalize to the long form
    pub fn to_task(&self) -> PipelineTask {
        match self {
            Self::Dependencies(deps) => PipelineTask {
                depends_on: deps.clone(),
                ..PipelineTask::default()
            },
            Self::Task(task) => task.clone(),
        }
    }
}

impl From<PipelineTask> for PipelineEntry {
    fn from(task: PipelineTask) -> Self {
        Self::Task(task)
    }
}

/// A task in the pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTask {
    /// Explicit command; overrides the package script of the same name
    pub command: Option<String>,

    /// Run the package script named after the task when no command is set.
    /// When false and no command is set, the task is purely structural.
    pub script: bool,

    /// Dependency references: `name`, `^name`, `package#name` or `...`
    pub depends_on: Vec<String>,

    /// Tasks this one should be scheduled before when both are ready
    pub before: Vec<String>,

    /// Tasks this one should be scheduled after when both are ready
    pub after: Vec<String>,

    /// Input glob patterns (for cache key computation)
    pub inputs: Vec<String>,

    /// Output glob patterns (for caching)
    pub outputs: Vec<String>,

    /// How outputs are detected after the command runs
    pub output_detection: OutputDetectionKind,

    /// Environment variables passed to the command
    pub env: BTreeMap<String, String>,
}

impl Default for PipelineTask {
    fn default() -> Self {
        Self {
            command: None,
            script: true,
            depends_on: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_detection: OutputDetectionKind::default(),
            env: BTreeMap::new(),
        }
    }
}

/// Output detection strategy selectable per task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputDetectionKind {
    /// Expand the declared output globs
    #[default]
    Patterns,
    /// Diff a filesystem snapshot taken before and after execution
    Snapshot,
    /// Snapshot diff filtered by the declared output globs
    Hybrid,
}

/// Per-package task overrides, read from `<package>/kiln.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PackageTasksConfig {
    /// Task overrides keyed by task name
    pub tasks: BTreeMap<String, PipelineEntry>,
}

/// Shared build-output cache configuration, as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedCacheConfig {
    /// Cache directory; the shared cache is disabled when no directory is configured
    pub dir: Option<PathBuf>,

    /// Never write new entries
    pub read_only: bool,

    /// Re-hash every output before restoring it
    pub verify_integrity: bool,

    /// Size threshold used by prune
    pub max_size_mb: u64,

    /// Age threshold used by prune
    pub max_age_days: u64,

    /// Prune automatically after each run
    pub auto_prune: bool,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            read_only: false,
            verify_integrity: false,
            max_size_mb: 5 * 1024,
            max_age_days: 30,
            auto_prune: false,
        }
    }
}

/// Environment fingerprint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Command whose first output line identifies the toolchain runtime
    pub runtime_version_command: String,

    /// Lockfile names checked at the workspace root, first match wins
    pub lockfiles: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            runtime_version_command: "node --version".to_string(),
            lockfiles: vec![
                "pnpm-lock.yaml".to_string(),
                "package-lock.json".to_string(),
                "yarn.lock".to_string(),
                "Cargo.lock".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_short_form() {
        let config: Config = toml::from_str(
            r#"
[tasks.pipeline]
build = ["^build"]
"#,
        )
        .unwrap();

        let build = config.tasks.pipeline.get("build").unwrap().to_task();
        assert_eq!(build.depends_on, vec!["^build"]);
        assert!(build.script);
        assert!(build.command.is_none());
    }

    #[test]
    fn test_pipeline_long_form() {
        let config: Config = toml::from_str(
            r#"
[tasks.pipeline.compile]
command = "tsc"
depends_on = ["^compile"]
after = ["lint"]
outputs = ["lib/**"]
output_detection = "hybrid"
"#,
        )
        .unwrap();

        let compile = config.tasks.pipeline.get("compile").unwrap().to_task();
        assert_eq!(compile.command.as_deref(), Some("tsc"));
        assert_eq!(compile.after, vec!["lint"]);
        assert_eq!(compile.output_detection, OutputDetectionKind::Hybrid);
    }

    #[test]
    fn test_cache_defaults() {
        let config = Config::default();
        assert!(config.cache.dir.is_none());
        assert!(!config.cache.read_only);
        assert_eq!(config.cache.max_age_days, 30);
        assert_eq!(config.environment.runtime_version_command, "node --version");
    }

    #[test]
    fn test_package_tasks_config() {
        let config: PackageTasksConfig = serde_yaml::from_str(
            r#"
tasks:
  build:
    - "..."
    - "codegen"
  codegen:
    command: "node gen.js"
"#,
        )
        .unwrap();

        assert_eq!(config.tasks.len(), 2);
        let build = config.tasks.get("build").unwrap().to_task();
        assert_eq!(build.depends_on, vec!["...", "codegen"]);
    }
}
