//! Task kinds: how a task's cache inputs and outputs are determined
//!
//! A kind is picked by the executable of the task's command. Generic shell
//! commands hash the package's files and use the configured output
//! detection; `tsc` derives both sides from the TypeScript project.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::debug;

use kiln_cache::environment::query_version;
use kiln_cache::fileops::hash_bytes;
use kiln_cache::key::executable_of;
use kiln_cache::outputs::{build_globset, expand_patterns, walk_files};
use kiln_cache::{CacheError, InputFileHash, OutputDetection};
use kiln_core::config::OutputDetectionKind;

use crate::hash_cache::FileHashCache;
use crate::incremental::read_done_record;
use crate::task::{TaskDefinition, TaskId};

/// What a kind needs to know about the task being prepared
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    /// Task identifier
    pub id: &'a TaskId,
    /// Resolved definition
    pub definition: &'a TaskDefinition,
    /// Command that will run
    pub command: &'a str,
    /// Package directory
    pub package_dir: &'a Path,
    /// Session hash memo
    pub hashes: &'a FileHashCache,
}

/// Inputs contributed to the cache key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInputs {
    /// Input files and hashes, relative to the package directory
    pub files: Vec<InputFileHash>,
    /// Tool version, when known
    pub tool_version: Option<String>,
    /// Named configuration hashes
    pub config_hashes: BTreeMap<String, String>,
}

/// Outputs expected from a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOutputs {
    /// Declared output paths or patterns, part of the cache key
    pub declared: Vec<String>,
    /// How outputs are found after execution
    pub detection: OutputDetection,
}

/// Errors while preparing cache inputs
#[derive(Debug, thiserror::Error)]
pub enum TaskKindError {
    /// Could not enumerate or match files
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Could not hash an input
    #[error("Failed to hash {path}: {source}")]
    Hash {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Per-kind hooks for cache inputs and outputs
pub trait TaskKind: Send + Sync + fmt::Debug {
    /// Kind name for logs
    fn name(&self) -> &'static str;

    /// Files, tool version and configuration hashes the outputs depend on
    fn cache_inputs(&self, ctx: &TaskContext<'_>) -> Result<CacheInputs, TaskKindError>;

    /// Outputs the task is expected to produce
    fn cache_outputs(&self, ctx: &TaskContext<'_>) -> Result<CacheOutputs, TaskKindError>;
}

fn hash_inputs(ctx: &TaskContext<'_>, files: Vec<String>) -> Result<Vec<InputFileHash>, TaskKindError> {
    files
        .into_iter()
        .map(|path| {
            let full = ctx.package_dir.join(&path);
            let hash = ctx
                .hashes
                .hash(&full)
                .map_err(|source| TaskKindError::Hash { path: full, source })?;
            Ok(InputFileHash { path, hash })
        })
        .collect()
}

fn env_hashes(definition: &TaskDefinition) -> BTreeMap<String, String> {
    definition
        .env
        .iter()
        .map(|(name, value)| (format!("env:{}", name), hash_bytes(value.as_bytes())))
        .collect()
}

/// Any command: inputs are package files, outputs follow the task's detection setting
#[derive(Debug, Default)]
pub struct ShellTask;

impl TaskKind for ShellTask {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn cache_inputs(&self, ctx: &TaskContext<'_>) -> Result<CacheInputs, TaskKindError> {
        let definition = ctx.definition;
        let files = if definition.inputs.is_empty() {
            let all = walk_files(ctx.package_dir)?;
            if definition.outputs.is_empty() {
                // Undeclared outputs are known only from the previous run
                let previous = read_done_record(ctx.package_dir, &ctx.id.task_name)
                    .map(|record| record.outputs)
                    .unwrap_or_default();
                all.into_iter().filter(|p| !previous.contains_key(p)).collect()
            } else {
                let outputs = build_globset(&definition.outputs)?;
                all.into_iter().filter(|p| !outputs.is_match(p)).collect()
            }
        } else {
            expand_patterns(ctx.package_dir, &definition.inputs)?
        };

        Ok(CacheInputs {
            files: hash_inputs(ctx, files)?,
            tool_version: None,
            config_hashes: env_hashes(definition),
        })
    }

    fn cache_outputs(&self, ctx: &TaskContext<'_>) -> Result<CacheOutputs, TaskKindError> {
        let outputs = ctx.definition.outputs.clone();
        let detection = match ctx.definition.output_detection {
            OutputDetectionKind::Patterns => OutputDetection::Patterns(outputs.clone()),
            OutputDetectionKind::Snapshot => OutputDetection::SnapshotDiff,
            OutputDetectionKind::Hybrid => OutputDetection::Hybrid(outputs.clone()),
        };
        Ok(CacheOutputs {
            declared: outputs,
            detection,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TsConfigFile {
    compiler_options: CompilerOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CompilerOptions {
    root_dir: Option<String>,
    out_dir: Option<String>,
    declaration: Option<bool>,
    composite: Option<bool>,
    emit_declaration_only: Option<bool>,
    no_emit: Option<bool>,
    ts_build_info_file: Option<String>,
}

/// A TypeScript project as far as caching is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
struct TsProject {
    /// tsconfig path relative to the package
    config: String,
    root_dir: String,
    out_dir: Option<String>,
    declaration: bool,
    emit_js: bool,
    build_info: String,
}

/// Normalize a relative path: forward slashes, no `.` segments, no trailing slash
fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    parts.join("/")
}

fn join(dir: &str, file: &str) -> String {
    normalize(&format!("{}/{}", dir, file))
}

fn parent_of(path: &str) -> String {
    path.rsplit_once('/').map(|(dir, _)| dir.to_string()).unwrap_or_default()
}

/// `-p`/`--project` argument of a tsc command line
fn project_argument(command: &str) -> Option<String> {
    let mut args = command.split_whitespace().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-p" || arg == "--project" {
            return args.next().map(str::to_string);
        }
        if let Some(value) = arg.strip_prefix("--project=") {
            return Some(value.to_string());
        }
    }
    None
}

impl TsProject {
    fn load(package_dir: &Path, command: &str) -> Self {
        let config = match project_argument(command) {
            Some(arg) if package_dir.join(&arg).is_dir() => join(&arg, "tsconfig.json"),
            Some(arg) => normalize(&arg),
            None => "tsconfig.json".to_string(),
        };

        let options = std::fs::read(package_dir.join(&config))
            .ok()
            .and_then(|bytes| match serde_json::from_slice::<TsConfigFile>(&bytes) {
                Ok(file) => Some(file.compiler_options),
                Err(e) => {
                    debug!(config = %config, error = %e, "could not parse tsconfig, using defaults");
                    None
                }
            })
            .unwrap_or_default();

        let config_dir = parent_of(&config);
        let resolve = |p: &str| join(&config_dir, p);

        let root_dir = match &options.root_dir {
            Some(dir) => resolve(dir),
            None if package_dir.join(resolve("src")).is_dir() => resolve("src"),
            None => config_dir.clone(),
        };
        let out_dir = options.out_dir.as_deref().map(resolve);

        let stem = config
            .rsplit('/')
            .next()
            .unwrap_or("tsconfig.json")
            .trim_end_matches(".json")
            .to_string();
        let build_info = match (&options.ts_build_info_file, &out_dir) {
            (Some(file), _) => resolve(file),
            (None, Some(out)) => join(out, &format!("{}.tsbuildinfo", stem)),
            (None, None) => join(&config_dir, &format!("{}.tsbuildinfo", stem)),
        };

        let no_emit = options.no_emit.unwrap_or(false);
        Self {
            config,
            root_dir,
            out_dir,
            declaration: !no_emit && options.declaration.or(options.composite).unwrap_or(false),
            emit_js: !no_emit && !options.emit_declaration_only.unwrap_or(false),
            build_info,
        }
    }

    /// TypeScript sources under the root directory, relative to the package
    fn sources(&self, package_dir: &Path) -> Result<Vec<String>, CacheError> {
        let root = package_dir.join(&self.root_dir);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let out_prefix = self.out_dir.as_ref().map(|o| format!("{}/", o));
        Ok(walk_files(&root)?
            .into_iter()
            .map(|rel| join(&self.root_dir, &rel))
            .filter(|rel| source_flavor(rel).is_some())
            .filter(|rel| match &out_prefix {
                Some(prefix) => !rel.starts_with(prefix.as_str()),
                None => true,
            })
            .collect())
    }

    /// Files emitted for one source
    fn emitted(&self, source: &str) -> Vec<String> {
        let Some((stem, flavor)) = source_flavor(source) else {
            return Vec::new();
        };
        if flavor.is_declaration {
            return Vec::new();
        }

        let relative = stem
            .strip_prefix(self.root_dir.as_str())
            .map(|s| s.trim_start_matches('/'))
            .unwrap_or(stem);
        let base = match &self.out_dir {
            Some(out) => join(out, relative),
            None => stem.to_string(),
        };

        let mut files = Vec::new();
        if self.emit_js {
            files.push(format!("{}.{}", base, flavor.js));
        }
        if self.declaration {
            files.push(format!("{}.{}", base, flavor.dts));
        }
        files
    }
}

struct Flavor {
    js: &'static str,
    dts: &'static str,
    is_declaration: bool,
}

/// Split a TypeScript source into stem and flavor; `None` for other files
fn source_flavor(path: &str) -> Option<(&str, Flavor)> {
    const TABLE: &[(&str, &str, &str, bool)] = &[
        (".d.mts", "mjs", "d.mts", true),
        (".d.cts", "cjs", "d.cts", true),
        (".d.ts", "js", "d.ts", true),
        (".mts", "mjs", "d.mts", false),
        (".cts", "cjs", "d.cts", false),
        (".tsx", "js", "d.ts", false),
        (".ts", "js", "d.ts", false),
    ];
    TABLE.iter().find_map(|(suffix, js, dts, is_declaration)| {
        path.strip_suffix(suffix).map(|stem| {
            (
                stem,
                Flavor {
                    js,
                    dts,
                    is_declaration: *is_declaration,
                },
            )
        })
    })
}

/// The TypeScript compiler: sources in, emitted files plus build info out
#[derive(Debug, Default)]
pub struct TscTask {
    versions: Mutex<HashMap<PathBuf, Option<String>>>,
}

impl TscTask {
    /// Version of the tsc the package would run, memoized per binary
    fn tool_version(&self, package_dir: &Path) -> Option<String> {
        let local = package_dir.join("node_modules/.bin/tsc");
        let binary = if local.is_file() { local } else { PathBuf::from("tsc") };

        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        versions
            .entry(binary.clone())
            .or_insert_with(|| query_version(&format!("{} --version", binary.display())))
            .clone()
    }
}

impl TaskKind for TscTask {
    fn name(&self) -> &'static str {
        "tsc"
    }

    fn cache_inputs(&self, ctx: &TaskContext<'_>) -> Result<CacheInputs, TaskKindError> {
        let project = TsProject::load(ctx.package_dir, ctx.command);
        let mut files = project.sources(ctx.package_dir)?;

        let mut config_hashes = env_hashes(ctx.definition);
        let config_path = ctx.package_dir.join(&project.config);
        if config_path.is_file() {
            let hash = ctx
                .hashes
                .hash(&config_path)
                .map_err(|source| TaskKindError::Hash {
                    path: config_path.clone(),
                    source,
                })?;
            config_hashes.insert(project.config.clone(), hash);
            files.push(project.config.clone());
        }

        Ok(CacheInputs {
            files: hash_inputs(ctx, files)?,
            tool_version: self.tool_version(ctx.package_dir),
            config_hashes,
        })
    }

    fn cache_outputs(&self, ctx: &TaskContext<'_>) -> Result<CacheOutputs, TaskKindError> {
        let project = TsProject::load(ctx.package_dir, ctx.command);
        let mut declared: Vec<String> = project
            .sources(ctx.package_dir)?
            .iter()
            .flat_map(|source| project.emitted(source))
            .collect();
        // The incremental state file is always an output
        declared.push(project.build_info.clone());
        declared.sort();
        declared.dedup();

        debug!(task = %ctx.id, outputs = declared.len(), "derived tsc outputs");
        Ok(CacheOutputs {
            detection: OutputDetection::Paths(declared.clone()),
            declared,
        })
    }
}

/// Picks a task kind from the command's executable
#[derive(Debug)]
pub struct TaskKindRegistry {
    kinds: HashMap<String, Arc<dyn TaskKind>>,
    fallback: Arc<dyn TaskKind>,
}

impl TaskKindRegistry {
    /// Registry with the built-in kinds
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("tsc", Arc::new(TscTask::default()));
        registry
    }

    /// Registry where every command is a generic shell task
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
            fallback: Arc::new(ShellTask),
        }
    }

    /// Register a kind for an executable name
    pub fn register(&mut self, executable: impl Into<String>, kind: Arc<dyn TaskKind>) {
        self.kinds.insert(executable.into(), kind);
    }

    /// Kind for a command line; compound shell commands are always generic
    pub fn for_command(&self, command: &str) -> Arc<dyn TaskKind> {
        let compound = ["&&", "||", ";", "|", "`", "$("]
            .iter()
            .any(|op| command.contains(op));
        if compound {
            return self.fallback.clone();
        }
        self.kinds
            .get(&executable_of(command))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for TaskKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}
