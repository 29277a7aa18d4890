//! Task execution reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::task::TaskId;

/// Where a cached result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSource {
    /// The package's own done record still matched
    Local,
    /// Outputs were restored from the shared cache
    Shared,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "up to date"),
            Self::Shared => write!(f, "shared cache"),
        }
    }
}

/// Events emitted during task execution
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task's dependencies are done and it waits for a worker
    Queued { id: TaskId },
    /// A task is starting; `command` is `None` for structural tasks
    Started { id: TaskId, command: Option<String> },
    /// A task produced output; `replayed` lines come from a cache entry
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
        replayed: bool,
    },
    /// The shared cache had no usable entry
    CacheMiss { id: TaskId, reason: String },
    /// A task completed successfully
    Completed {
        id: TaskId,
        duration: Duration,
        cache: Option<CacheSource>,
    },
    /// A task failed
    Failed {
        id: TaskId,
        duration: Duration,
        error: String,
    },
    /// A task never started
    Skipped { id: TaskId, reason: String },
    /// All tasks are finished
    AllCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        cached: usize,
        skipped: usize,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Queued { id } => {
                tracing::trace!(task = %id, "queued");
            }
            TaskEvent::Started { id, command } => {
                tracing::info!(task = %id, command = command.as_deref().unwrap_or("<none>"), "starting");
            }
            TaskEvent::Output {
                id,
                line,
                is_stderr,
                replayed,
            } => {
                tracing::debug!(task = %id, stderr = is_stderr, replayed, "{}", line);
            }
            TaskEvent::CacheMiss { id, reason } => {
                tracing::info!(task = %id, reason = %reason, "cache miss");
            }
            TaskEvent::Completed { id, duration, cache } => {
                tracing::info!(
                    task = %id,
                    duration_ms = duration.as_millis() as u64,
                    cache = cache.map(|c| c.to_string()).as_deref().unwrap_or("none"),
                    "completed"
                );
            }
            TaskEvent::Failed { id, duration, error } => {
                tracing::error!(task = %id, duration_ms = duration.as_millis() as u64, error = %error, "failed");
            }
            TaskEvent::Skipped { id, reason } => {
                tracing::info!(task = %id, reason = %reason, "skipped");
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                cached,
                skipped,
                duration,
            } => {
                tracing::info!(
                    total,
                    succeeded,
                    failed,
                    cached,
                    skipped,
                    duration_ms = duration.as_millis() as u64,
                    "all tasks complete"
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Broadcasts events to every registered reporter
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    /// Registry with the tracing reporter
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    /// Registry with no reporters
    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter
    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Add a shared reporter
    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    /// Registered reporters
    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
