//! Run command: execute tasks across the workspace

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use clap::Args;
use console::style;
use serde::Serialize;
use tracing::{info, warn};

use kiln_cache::environment::lockfile_hash;
use kiln_cache::{format_bytes, EnvironmentFingerprint};
use kiln_core::config::load_package_config;
use kiln_core::monorepo::{DependencyGraph, PackageDiscovery, Workspace};
use kiln_tasks::{
    CacheSource, DefinitionResolver, ExecutionOptions, RunSummary, SchedulerOptions, TaskDag,
    TaskEvent, TaskExecutor, TaskId, TaskReporter, TaskReporterRegistry, TaskResult,
    TaskScheduler, TaskStatus,
};

use crate::cli::context::Context;
use crate::cli::output::{self, plural, task_style};
use crate::cli::{Cli, OutputFormat};

/// Returned when at least one task failed
#[derive(Debug, thiserror::Error)]
#[error("{0} task(s) failed")]
pub struct TasksFailed(pub usize);

/// Run tasks across the workspace
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (e.g., build test lint)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Filter to specific packages (can be repeated)
    #[arg(long)]
    pub filter: Vec<String>,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,

    /// Continue running other tasks when one fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Neither read nor write the shared cache
    #[arg(long)]
    pub no_cache: bool,

    /// Run every task even when up to date or cached
    #[arg(long)]
    pub force: bool,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let context = Context::load(cli)?;
        let config = &context.config;

        // Discover workspace
        let workspace = Workspace::find_enclosing(&context.root)?
            .with_context(|| format!("No workspace found at {}", context.root.display()))?;
        let workspace_root = workspace.root.clone();
        let discovered = PackageDiscovery::new(workspace).discover()?;
        if discovered.is_empty() {
            anyhow::bail!("No packages found in workspace");
        }

        let graph = DependencyGraph::build(&discovered)?;
        if graph.has_cycles() {
            warn!(
                packages = ?graph.cyclic().collect::<Vec<_>>(),
                "package dependencies form a cycle"
            );
        }

        // Resolve task definitions
        let mut with_overrides = Vec::with_capacity(discovered.len());
        for package in &discovered {
            let overrides = load_package_config(&package.path)
                .with_context(|| format!("Invalid task configuration in package {}", package.name))?;
            with_overrides.push((package.clone(), overrides));
        }
        let tasks = DefinitionResolver::new(&config.tasks.pipeline).resolve_workspace(&with_overrides)?;

        // Determine which packages to include
        let packages: Vec<String> = if self.filter.is_empty() {
            let mut names: Vec<String> = discovered.iter().map(|p| p.name.clone()).collect();
            names.sort();
            names
        } else {
            for name in &self.filter {
                if !graph.contains(name) {
                    anyhow::bail!("Unknown package '{}' in --filter", name);
                }
            }
            self.filter.clone()
        };

        let dag = TaskDag::build(&graph, &tasks, &self.tasks, &packages)?;

        if dag.is_empty() {
            if cli.prints_text() {
                output::success("No tasks to run.");
            }
            return Ok(());
        }

        // Show plan
        if cli.prints_text() {
            println!();
            output::info(&format!(
                "{} across {}",
                plural(dag.len(), "task"),
                plural(dag.package_count(), "package")
            ));

            if cli.verbose || self.dry_run {
                println!();
                println!("{}", dag.execution_plan());
            }

            if self.dry_run {
                println!("{}", style("[DRY RUN - no tasks will be executed]").yellow().bold());
            }
            println!();
        }

        let environment = EnvironmentFingerprint::detect(&config.environment.runtime_version_command);
        let lockfile = lockfile_hash(&workspace_root, &config.environment.lockfiles);
        info!(
            platform = %environment.platform,
            runtime = %environment.runtime_version,
            "environment fingerprint"
        );

        let shared_cache = if self.no_cache || self.dry_run {
            None
        } else {
            context.open_cache_for_build()?.map(Arc::new)
        };

        // Set up reporters
        let mut reporters = TaskReporterRegistry::new();
        if cli.prints_text() && !self.dry_run {
            reporters.register(ConsoleReporter::new(cli.verbose));
        }
        let reporter: Arc<dyn TaskReporter> = Arc::new(reporters);

        let mut executor = TaskExecutor::new(environment, lockfile, reporter).with_options(
            ExecutionOptions {
                use_shared_cache: !self.no_cache,
                force: self.force,
            },
        );
        if let Some(cache) = &shared_cache {
            executor = executor.with_shared_cache(cache.clone());
        }

        let defaults = SchedulerOptions::default();
        let options = SchedulerOptions {
            concurrency: self
                .concurrency
                .or(config.tasks.concurrency)
                .unwrap_or(defaults.concurrency),
            continue_on_error: self.continue_on_error,
            dry_run: self.dry_run,
        };

        let started = std::time::Instant::now();
        let results = TaskScheduler::new(options, Arc::new(executor))
            .execute(&dag)
            .await;
        let summary = RunSummary::from_results(&results, started.elapsed());

        if let Some(cache) = &shared_cache {
            cache.flush_statistics();
            let settings = cache.settings();
            if settings.auto_prune && !settings.read_only {
                match cache.prune_with_settings() {
                    Ok(pruned) if pruned.removed() > 0 => {
                        info!(
                            removed = pruned.removed(),
                            freed = %format_bytes(pruned.freed_bytes),
                            "auto-pruned shared cache"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "auto-prune failed"),
                }
            }
        }

        if cli.format == OutputFormat::Json {
            let report = RunReport {
                summary: &summary,
                tasks: results.iter().map(TaskReport::from).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        let failed: Vec<&TaskResult> = results
            .iter()
            .filter(|r| matches!(r.status, TaskStatus::Failed(_)))
            .collect();

        if !failed.is_empty() {
            if cli.prints_text() {
                println!();
                println!(
                    "  {} {}/{} tasks failed:",
                    style("✗").red().bold(),
                    failed.len(),
                    results.len()
                );
                for r in &failed {
                    if let TaskStatus::Failed(ref err) = r.status {
                        println!("    {} {}: {}", style("✗").red(), r.id, err);
                    }
                }
            }
            return Err(TasksFailed(failed.len()).into());
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    summary: &'a RunSummary,
    tasks: Vec<TaskReport>,
}

#[derive(Serialize)]
struct TaskReport {
    id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_key: Option<String>,
}

impl From<&TaskResult> for TaskReport {
    fn from(result: &TaskResult) -> Self {
        let (status, detail) = match &result.status {
            TaskStatus::Success => ("success", None),
            TaskStatus::CachedSuccess(CacheSource::Local) => ("up_to_date", None),
            TaskStatus::CachedSuccess(CacheSource::Shared) => ("cached", None),
            TaskStatus::Failed(error) => ("failed", Some(error.clone())),
            TaskStatus::Skipped(reason) => ("skipped", Some(reason.clone())),
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running => ("incomplete", None),
        };
        Self {
            id: result.id.to_string(),
            status,
            detail,
            duration_ms: result.duration.as_millis() as u64,
            cache_key: result.cache_key.clone(),
        }
    }
}

/// Console reporter with live output.
///
/// Without `--verbose`, a task's output is held back and printed only if
/// the task fails.
struct ConsoleReporter {
    verbose: bool,
    buffered: Mutex<HashMap<TaskId, Vec<(String, bool)>>>,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self {
            verbose,
            buffered: Mutex::new(HashMap::new()),
        }
    }

    fn print_line(id: &TaskId, line: &str, is_stderr: bool) {
        let prefix = style(format!("[{}]", id)).dim();
        if is_stderr {
            println!("    {} {}", prefix, style(line).red());
        } else {
            println!("    {} {}", prefix, line);
        }
    }

    fn take_buffered(&self, id: &TaskId) -> Vec<(String, bool)> {
        self.buffered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .unwrap_or_default()
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Queued { .. } => {}
            TaskEvent::Started { id, command } => {
                if self.verbose {
                    println!(
                        "  {} {} {}",
                        style("▸").dim(),
                        task_style().apply_to(id),
                        style(format!("({})", command.as_deref().unwrap_or("no command"))).dim()
                    );
                }
            }
            TaskEvent::Output {
                id,
                line,
                is_stderr,
                ..
            } => {
                if self.verbose {
                    Self::print_line(id, line, *is_stderr);
                } else {
                    self.buffered
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .entry(id.clone())
                        .or_default()
                        .push((line.clone(), *is_stderr));
                }
            }
            TaskEvent::CacheMiss { id, reason } => {
                if self.verbose {
                    println!(
                        "  {} {} {}",
                        style("·").dim(),
                        id,
                        style(format!("cache miss: {}", reason)).dim()
                    );
                }
            }
            TaskEvent::Completed {
                id,
                duration,
                cache,
            } => {
                self.take_buffered(id);
                let note = match cache {
                    Some(CacheSource::Local) => style("(up to date)").cyan().to_string(),
                    Some(CacheSource::Shared) => style("(cached)").cyan().to_string(),
                    None => String::new(),
                };
                println!(
                    "  {} {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    note,
                    style(format!("{:.1}s", duration.as_secs_f64())).dim()
                );
            }
            TaskEvent::Failed {
                id,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    style(error).red().dim()
                );
                for (line, is_stderr) in self.take_buffered(id) {
                    Self::print_line(id, &line, is_stderr);
                }
            }
            TaskEvent::Skipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                cached,
                skipped,
                duration,
            } => {
                println!();
                println!(
                    "  {} {}/{} succeeded, {} failed, {} cached, {} skipped ({:.1}s)",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    succeeded,
                    total,
                    failed,
                    cached,
                    skipped,
                    duration.as_secs_f64()
                );
            }
        }
    }
}
