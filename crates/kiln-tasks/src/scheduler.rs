//! Task scheduler: priority ready queue over a bounded worker pool

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::dag::{TaskDag, TaskNode};
use crate::executor::{TaskExecutor, TaskResult, TaskStatus};
use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::TaskId;

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent tasks
    pub concurrency: usize,
    /// Keep launching independent tasks after a failure
    pub continue_on_error: bool,
    /// Report the plan without running anything
    pub dry_run: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            continue_on_error: false,
            dry_run: false,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Counts over a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Tasks in the run
    pub total: usize,
    /// Tasks that ran or were served from a cache
    pub succeeded: usize,
    /// Tasks whose command failed, or whose dependency did
    pub failed: usize,
    /// Subset of `succeeded` served from a cache
    pub cached: usize,
    /// Tasks that never started
    pub skipped: usize,
    /// Wall-clock time of the whole run
    pub duration_ms: u64,
}

impl RunSummary {
    /// Summarize task results
    pub fn from_results(results: &[TaskResult], duration: Duration) -> Self {
        let count = |f: fn(&TaskStatus) -> bool| results.iter().filter(|r| f(&r.status)).count();
        Self {
            total: results.len(),
            succeeded: count(TaskStatus::is_success),
            failed: count(|s| matches!(s, TaskStatus::Failed(_))),
            cached: count(|s| matches!(s, TaskStatus::CachedSuccess(_))),
            skipped: count(|s| matches!(s, TaskStatus::Skipped(_))),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Whether every task succeeded
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Entry in the ready queue; the greatest runs first
#[derive(Debug, PartialEq, Eq)]
struct ReadyTask {
    weight: usize,
    bias: i64,
    id: TaskId,
}

impl ReadyTask {
    fn new(node: &TaskNode) -> Self {
        Self {
            weight: node.weight,
            bias: node.bias,
            id: node.id.clone(),
        }
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then(self.bias.cmp(&other.bias))
            // Smaller id first
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Task scheduler: executes a DAG of tasks with bounded parallelism
pub struct TaskScheduler {
    options: SchedulerOptions,
    executor: Arc<TaskExecutor>,
}

impl TaskScheduler {
    /// Create a new scheduler
    pub fn new(options: SchedulerOptions, executor: Arc<TaskExecutor>) -> Self {
        Self { options, executor }
    }

    fn reporter(&self) -> &dyn TaskReporter {
        &**self.executor.reporter()
    }

    /// Execute all tasks in the DAG; results come back in topological order
    #[instrument(skip_all, fields(tasks = dag.len(), concurrency = self.options.concurrency))]
    pub async fn execute(&self, dag: &TaskDag) -> Vec<TaskResult> {
        let start = Instant::now();
        let mut results: HashMap<TaskId, TaskResult> = HashMap::new();

        if self.options.dry_run {
            for id in dag.sorted() {
                self.skip(id, "dry run", &mut results);
            }
        } else {
            self.run_all(dag, &mut results).await;
        }

        let ordered: Vec<TaskResult> = dag
            .sorted()
            .iter()
            .filter_map(|id| results.remove(id))
            .collect();

        let summary = RunSummary::from_results(&ordered, start.elapsed());
        self.reporter().report(&TaskEvent::AllCompleted {
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
            cached: summary.cached,
            skipped: summary.skipped,
            duration: start.elapsed(),
        });
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cached = summary.cached,
            skipped = summary.skipped,
            "run finished"
        );

        ordered
    }

    async fn run_all(&self, dag: &TaskDag, results: &mut HashMap<TaskId, TaskResult>) {
        let concurrency = self.options.concurrency.max(1);
        let mut states: BTreeMap<TaskId, TaskStatus> = dag
            .nodes()
            .keys()
            .map(|id| (id.clone(), TaskStatus::Pending))
            .collect();
        let mut waiting_on: HashMap<TaskId, usize> = dag
            .nodes()
            .values()
            .map(|n| (n.id.clone(), n.dependencies.len()))
            .collect();
        let mut ready: BinaryHeap<ReadyTask> = BinaryHeap::new();
        let mut running: JoinSet<TaskResult> = JoinSet::new();
        let mut aborted = false;

        for node in dag.nodes().values().filter(|n| n.dependencies.is_empty()) {
            self.enqueue(node, &mut states, &mut ready);
        }

        loop {
            while !aborted && running.len() < concurrency {
                let Some(next) = ready.pop() else {
                    break;
                };
                let Some(node) = dag.get(&next.id) else {
                    continue;
                };
                states.insert(next.id.clone(), TaskStatus::Running);
                debug!(task = %next.id, weight = next.weight, bias = next.bias, "launching");
                running.spawn(spawn_guarded(self.executor.clone(), node.clone()));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "task supervisor stopped unexpectedly");
                    continue;
                }
            };

            let id = result.id.clone();
            states.insert(id.clone(), result.status.clone());
            let success = result.status.is_success();
            results.insert(id.clone(), result);

            if success {
                if let Some(node) = dag.get(&id) {
                    for dependent in &node.dependents {
                        let Some(count) = waiting_on.get_mut(dependent) else {
                            continue;
                        };
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            if let Some(dependent_node) = dag.get(dependent) {
                                self.enqueue(dependent_node, &mut states, &mut ready);
                            }
                        }
                    }
                }
            } else {
                self.fail_dependents(dag, &id, &mut states, results);
                if !self.options.continue_on_error && !aborted {
                    info!(task = %id, "task failed, not starting new tasks");
                    aborted = true;
                }
            }
        }

        for (id, state) in states {
            if state.is_finished() {
                continue;
            }
            if aborted {
                self.skip(&id, "build aborted", results);
            } else {
                // Only reachable if a task supervisor was lost
                let error = "task did not complete".to_string();
                self.reporter().report(&TaskEvent::Failed {
                    id: id.clone(),
                    duration: Duration::ZERO,
                    error: error.clone(),
                });
                results.insert(
                    id.clone(),
                    TaskResult::new(id, TaskStatus::Failed(error), Duration::ZERO),
                );
            }
        }
    }

    fn enqueue(
        &self,
        node: &TaskNode,
        states: &mut BTreeMap<TaskId, TaskStatus>,
        ready: &mut BinaryHeap<ReadyTask>,
    ) {
        if states.get(&node.id) != Some(&TaskStatus::Pending) {
            return;
        }
        states.insert(node.id.clone(), TaskStatus::Queued);
        self.reporter().report(&TaskEvent::Queued {
            id: node.id.clone(),
        });
        ready.push(ReadyTask::new(node));
    }

    /// Mark every transitive dependent of a failed task as failed
    fn fail_dependents(
        &self,
        dag: &TaskDag,
        failed: &TaskId,
        states: &mut BTreeMap<TaskId, TaskStatus>,
        results: &mut HashMap<TaskId, TaskResult>,
    ) {
        let mut queue: VecDeque<&TaskId> = dag
            .get(failed)
            .map(|n| n.dependents.iter().collect())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            if states.get(id).is_some_and(TaskStatus::is_finished) {
                continue;
            }
            let error = format!("blocked by failed dependency {}", failed);
            self.reporter().report(&TaskEvent::Failed {
                id: id.clone(),
                duration: Duration::ZERO,
                error: error.clone(),
            });
            let status = TaskStatus::Failed(error);
            states.insert(id.clone(), status.clone());
            results.insert(id.clone(), TaskResult::new(id.clone(), status, Duration::ZERO));

            if let Some(node) = dag.get(id) {
                queue.extend(node.dependents.iter());
            }
        }
    }

    fn skip(&self, id: &TaskId, reason: &str, results: &mut HashMap<TaskId, TaskResult>) {
        self.reporter().report(&TaskEvent::Skipped {
            id: id.clone(),
            reason: reason.to_string(),
        });
        results.insert(
            id.clone(),
            TaskResult::new(
                id.clone(),
                TaskStatus::Skipped(reason.to_string()),
                Duration::ZERO,
            ),
        );
    }
}

/// Run a task on its own tokio task so a panic becomes a failed result
async fn spawn_guarded(executor: Arc<TaskExecutor>, node: TaskNode) -> TaskResult {
    let id = node.id.clone();
    let reporter = executor.reporter().clone();
    let handle = tokio::spawn(async move { executor.execute(&node).await });

    match handle.await {
        Ok(result) => result,
        Err(e) => {
            let error = format!("Task panicked: {}", e);
            reporter.report(&TaskEvent::Failed {
                id: id.clone(),
                duration: Duration::ZERO,
                error: error.clone(),
            });
            TaskResult::new(id, TaskStatus::Failed(error), Duration::ZERO)
        }
    }
}
