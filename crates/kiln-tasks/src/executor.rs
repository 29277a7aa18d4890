//! Per-task execution pipeline
//!
//! A task that is up to date locally finishes at once; otherwise the shared
//! cache is consulted, and only on a miss does the command run. Every cache
//! failure degrades to running the command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use kiln_cache::{
    compute_cache_key, CacheEntry, CacheKey, CacheKeyInputs, EnvironmentFingerprint,
    LookupOutcome, OutputDetection, OutputDetector, SharedCache, StoreOutcome, StoreRequest,
};

use crate::dag::TaskNode;
use crate::hash_cache::FileHashCache;
use crate::incremental::{
    clear_done_record, hash_outputs, is_up_to_date, read_done_record, write_done_record,
    DoneRecord,
};
use crate::kinds::{TaskContext, TaskKindError, TaskKindRegistry};
use crate::reporter::{CacheSource, TaskEvent, TaskReporter};
use crate::task::TaskId;

/// Task execution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for dependencies
    Pending,
    /// Ready, waiting for a worker
    Queued,
    /// Executing
    Running,
    /// Command ran and exited with 0, or the task has no command
    Success,
    /// Outputs were already present or restored; the command did not run
    CachedSuccess(CacheSource),
    /// Command failed, or a dependency did
    Failed(String),
    /// Never started
    Skipped(String),
}

impl TaskStatus {
    /// Check if this status represents success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::CachedSuccess(_))
    }

    /// Whether the task reached a final state
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Queued | Self::Running)
    }
}

/// Result of a single task execution
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Task that was executed
    pub id: TaskId,
    /// Final status
    pub status: TaskStatus,
    /// How long the task took
    pub duration: Duration,
    /// Captured (or replayed) stdout
    pub stdout: String,
    /// Captured (or replayed) stderr
    pub stderr: String,
    /// Cache key, when cache inputs could be computed
    pub cache_key: Option<String>,
}

impl TaskResult {
    /// Result without output
    pub fn new(id: TaskId, status: TaskStatus, duration: Duration) -> Self {
        Self {
            id,
            status,
            duration,
            stdout: String::new(),
            stderr: String::new(),
            cache_key: None,
        }
    }
}

/// Cache behavior for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Read and write the shared cache
    pub use_shared_cache: bool,
    /// Run every command even when up to date or cached; results are still recorded
    pub force: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            use_shared_cache: true,
            force: false,
        }
    }
}

/// Cache inputs of a task about to run
struct Prepared {
    inputs: CacheKeyInputs,
    key: CacheKey,
    detection: OutputDetection,
}

/// Output of a finished command
struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Runs single tasks through the local check, shared cache and command
pub struct TaskExecutor {
    shared_cache: Option<Arc<SharedCache>>,
    hashes: Arc<FileHashCache>,
    kinds: TaskKindRegistry,
    environment: EnvironmentFingerprint,
    lockfile_hash: String,
    reporter: Arc<dyn TaskReporter>,
    options: ExecutionOptions,
}

impl TaskExecutor {
    /// Executor without a shared cache
    pub fn new(
        environment: EnvironmentFingerprint,
        lockfile_hash: impl Into<String>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            shared_cache: None,
            hashes: Arc::new(FileHashCache::new()),
            kinds: TaskKindRegistry::new(),
            environment,
            lockfile_hash: lockfile_hash.into(),
            reporter,
            options: ExecutionOptions::default(),
        }
    }

    /// Use a shared cache
    pub fn with_shared_cache(mut self, cache: Arc<SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    /// Use a specific task kind registry
    pub fn with_kinds(mut self, kinds: TaskKindRegistry) -> Self {
        self.kinds = kinds;
        self
    }

    /// Share a hash memo with other executors
    pub fn with_hash_cache(mut self, hashes: Arc<FileHashCache>) -> Self {
        self.hashes = hashes;
        self
    }

    /// Set cache behavior
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Reporter receiving this executor's events
    pub fn reporter(&self) -> &Arc<dyn TaskReporter> {
        &self.reporter
    }

    fn shared_cache(&self) -> Option<&SharedCache> {
        if self.options.use_shared_cache {
            self.shared_cache.as_deref()
        } else {
            None
        }
    }

    /// Run one task whose dependencies have all succeeded
    #[instrument(skip_all, fields(task = %node.id))]
    pub async fn execute(&self, node: &TaskNode) -> TaskResult {
        let start = Instant::now();
        let id = &node.id;

        let Some(command) = node.command() else {
            self.reporter.report(&TaskEvent::Started {
                id: id.clone(),
                command: None,
            });
            self.reporter.report(&TaskEvent::Completed {
                id: id.clone(),
                duration: start.elapsed(),
                cache: None,
            });
            return TaskResult::new(id.clone(), TaskStatus::Success, start.elapsed());
        };

        self.reporter.report(&TaskEvent::Started {
            id: id.clone(),
            command: Some(command.to_string()),
        });

        let prepared = match self.prepare(node, command) {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                warn!(error = %e, "could not compute cache inputs, running without cache");
                None
            }
        };

        if let Some(prepared) = &prepared {
            if let Some(result) = self.check_caches(node, command, prepared, start) {
                return result;
            }
        }

        self.run(node, command, prepared.as_ref(), start).await
    }

    fn prepare(&self, node: &TaskNode, command: &str) -> Result<Prepared, TaskKindError> {
        let kind = self.kinds.for_command(command);
        let ctx = TaskContext {
            id: &node.id,
            definition: &node.definition,
            command,
            package_dir: &node.package_dir,
            hashes: &self.hashes,
        };
        let cache_inputs = kind.cache_inputs(&ctx)?;
        let outputs = kind.cache_outputs(&ctx)?;

        let mut inputs = CacheKeyInputs::new(
            &node.id.package,
            &node.id.task_name,
            command,
            self.environment.clone(),
            &self.lockfile_hash,
        );
        inputs.input_hashes = cache_inputs.files;
        inputs.output_paths = outputs.declared;
        inputs.tool_version = cache_inputs.tool_version;
        inputs.config_hashes = cache_inputs.config_hashes;

        let key = compute_cache_key(&inputs);
        debug!(
            kind = kind.name(),
            key = key.short(),
            inputs = inputs.input_hashes.len(),
            "computed cache key"
        );

        Ok(Prepared {
            inputs,
            key,
            detection: outputs.detection,
        })
    }

    /// Local done record first, then the shared cache
    fn check_caches(
        &self,
        node: &TaskNode,
        command: &str,
        prepared: &Prepared,
        start: Instant,
    ) -> Option<TaskResult> {
        if self.options.force {
            return None;
        }
        let id = &node.id;

        if let Some(record) = read_done_record(&node.package_dir, &id.task_name) {
            if is_up_to_date(
                &record,
                &node.package_dir,
                prepared.key.as_str(),
                command,
                &prepared.inputs.input_hashes,
                &self.hashes,
            ) {
                debug!("up to date");
                return Some(self.finish_cached(id, CacheSource::Local, prepared, start, None));
            }
        }

        let cache = self.shared_cache()?;
        match cache.lookup(&prepared.inputs) {
            LookupOutcome::Hit(entry) => self.restore(node, command, prepared, cache, &entry, start),
            LookupOutcome::Miss(reason) => {
                self.reporter.report(&TaskEvent::CacheMiss {
                    id: id.clone(),
                    reason: reason.to_string(),
                });
                None
            }
        }
    }

    /// Restore a hit into the package; `None` falls back to running the command
    fn restore(
        &self,
        node: &TaskNode,
        command: &str,
        prepared: &Prepared,
        cache: &SharedCache,
        entry: &CacheEntry,
        start: Instant,
    ) -> Option<TaskResult> {
        let id = &node.id;
        let restored = cache.restore(entry, &node.package_dir);

        let paths: Vec<String> = entry
            .manifest
            .output_files
            .iter()
            .map(|f| f.path.clone())
            .collect();
        self.invalidate(&node.package_dir, &paths);

        if !restored.is_success() {
            let failed = restored.failures().count();
            warn!(key = entry.key.short(), failed, "restore incomplete, running task");
            self.reporter.report(&TaskEvent::CacheMiss {
                id: id.clone(),
                reason: format!("{} output file(s) could not be restored", failed),
            });
            return None;
        }

        self.record_done(node, command, prepared, &paths);

        for line in restored.stdout.lines() {
            self.reporter.report(&TaskEvent::Output {
                id: id.clone(),
                line: line.to_string(),
                is_stderr: false,
                replayed: true,
            });
        }
        for line in restored.stderr.lines() {
            self.reporter.report(&TaskEvent::Output {
                id: id.clone(),
                line: line.to_string(),
                is_stderr: true,
                replayed: true,
            });
        }

        Some(self.finish_cached(
            id,
            CacheSource::Shared,
            prepared,
            start,
            Some((restored.stdout, restored.stderr)),
        ))
    }

    fn finish_cached(
        &self,
        id: &TaskId,
        source: CacheSource,
        prepared: &Prepared,
        start: Instant,
        output: Option<(String, String)>,
    ) -> TaskResult {
        let duration = start.elapsed();
        self.reporter.report(&TaskEvent::Completed {
            id: id.clone(),
            duration,
            cache: Some(source),
        });

        let mut result = TaskResult::new(id.clone(), TaskStatus::CachedSuccess(source), duration);
        if let Some((stdout, stderr)) = output {
            result.stdout = stdout;
            result.stderr = stderr;
        }
        result.cache_key = Some(prepared.key.to_string());
        result
    }

    /// Execute the command and record the results
    async fn run(
        &self,
        node: &TaskNode,
        command: &str,
        prepared: Option<&Prepared>,
        start: Instant,
    ) -> TaskResult {
        let id = &node.id;
        let dir = &node.package_dir;

        clear_done_record(dir, &id.task_name);

        let mut detector = prepared.map(|p| OutputDetector::new(p.detection.clone(), dir.clone()));
        if let Some(d) = detector.as_mut() {
            if let Err(e) = d.before_execution() {
                warn!(error = %e, "could not snapshot package, outputs will not be cached");
                detector = None;
            }
        }

        let output = match run_command(id, command, dir, &node.definition.env, &*self.reporter).await
        {
            Ok(output) => output,
            Err(error) => return self.fail(id, error, start, String::new(), String::new()),
        };

        if output.exit_code != 0 {
            let error = format!("Command exited with code {}", output.exit_code);
            return self.fail(id, error, start, output.stdout, output.stderr);
        }

        let duration = start.elapsed();
        let mut result = TaskResult::new(id.clone(), TaskStatus::Success, duration);

        if let (Some(prepared), Some(detector)) = (prepared, detector) {
            self.record_success(node, command, prepared, &detector, &output);
            result.cache_key = Some(prepared.key.to_string());
        }

        self.reporter.report(&TaskEvent::Completed {
            id: id.clone(),
            duration,
            cache: None,
        });
        result.stdout = output.stdout;
        result.stderr = output.stderr;
        result
    }

    /// Write the done record and the shared entry after a successful run
    fn record_success(
        &self,
        node: &TaskNode,
        command: &str,
        prepared: &Prepared,
        detector: &OutputDetector,
        output: &CommandOutput,
    ) {
        let dir = &node.package_dir;

        let inputs: Vec<String> = prepared
            .inputs
            .input_hashes
            .iter()
            .map(|i| i.path.clone())
            .collect();
        self.invalidate(dir, &inputs);

        let outputs = match detector.detect() {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(error = %e, "output detection failed, not caching");
                return;
            }
        };
        self.invalidate(dir, &outputs);
        debug!(outputs = outputs.len(), "detected outputs");

        self.record_done(node, command, prepared, &outputs);

        let Some(cache) = self.shared_cache() else {
            return;
        };
        let request = StoreRequest {
            inputs: &prepared.inputs,
            source_root: dir,
            outputs: &outputs,
            stdout: &output.stdout,
            stderr: &output.stderr,
            exit_code: output.exit_code,
        };
        match cache.store(request) {
            Ok(StoreOutcome::Stored { key, files, bytes }) => {
                debug!(key = key.short(), files, bytes, "stored in shared cache");
            }
            Ok(outcome) => debug!(?outcome, "shared cache not updated"),
            Err(e) => warn!(error = %e, "failed to store in shared cache"),
        }
    }

    fn record_done(&self, node: &TaskNode, command: &str, prepared: &Prepared, outputs: &[String]) {
        let dir = &node.package_dir;
        let output_hashes = match hash_outputs(dir, outputs, &self.hashes) {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!(error = %e, "could not hash outputs, skipping done record");
                return;
            }
        };

        let mut record = DoneRecord::new(command, &prepared.inputs.input_hashes, output_hashes);
        record.cache_key = Some(prepared.key.to_string());
        if let Err(e) = write_done_record(dir, &node.id.task_name, &record) {
            warn!(error = %e, "failed to write done record");
        }
    }

    fn invalidate(&self, dir: &Path, paths: &[String]) {
        let full: Vec<PathBuf> = paths.iter().map(|p| dir.join(p)).collect();
        self.hashes.invalidate(full.iter().map(PathBuf::as_path));
    }

    fn fail(
        &self,
        id: &TaskId,
        error: String,
        start: Instant,
        stdout: String,
        stderr: String,
    ) -> TaskResult {
        let duration = start.elapsed();
        self.reporter.report(&TaskEvent::Failed {
            id: id.clone(),
            duration,
            error: error.clone(),
        });
        TaskResult {
            stdout,
            stderr,
            ..TaskResult::new(id.clone(), TaskStatus::Failed(error), duration)
        }
    }
}

/// `PATH` with the package's `node_modules/.bin` in front
fn command_path(package_dir: &Path) -> Option<std::ffi::OsString> {
    let bin = package_dir.join("node_modules").join(".bin");
    let mut paths = vec![bin];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).ok()
}

/// Run a shell command in the package directory, streaming its output
async fn run_command(
    id: &TaskId,
    cmd: &str,
    package_dir: &Path,
    env: &BTreeMap<String, String>,
    reporter: &dyn TaskReporter,
) -> Result<CommandOutput, String> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(package_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(path) = command_path(package_dir) {
        command.env("PATH", path);
    }

    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to spawn: {}", e))?;

    let (stdout, stderr) = tokio::join!(
        read_lines(child.stdout.take(), id, false, reporter),
        read_lines(child.stderr.take(), id, true, reporter),
    );

    let status = child
        .wait()
        .await
        .map_err(|e| format!("Failed to wait: {}", e))?;

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

async fn read_lines<R: AsyncRead + Unpin>(
    stream: Option<R>,
    id: &TaskId,
    is_stderr: bool,
    reporter: &dyn TaskReporter,
) -> String {
    let Some(stream) = stream else {
        return String::new();
    };
    let mut captured = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        reporter.report(&TaskEvent::Output {
            id: id.clone(),
            line: line.clone(),
            is_stderr,
            replayed: false,
        });
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}
