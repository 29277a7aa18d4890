//! Kiln Tasks - task graph scheduler and cached execution engine
//!
//! Task definitions are resolved per package, expanded into a DAG of
//! `package#task` nodes and run by a priority scheduler. Each task checks
//! its local done record, then the shared cache, before running its command.

pub mod dag;
pub mod definition;
pub mod executor;
pub mod hash_cache;
pub mod incremental;
pub mod kinds;
pub mod reporter;
pub mod scheduler;
pub mod task;

pub use dag::{DagError, TaskDag, TaskNode};
pub use definition::{DefinitionError, DefinitionResolver, PackageTasks, WorkspaceTasks};
pub use executor::{ExecutionOptions, TaskExecutor, TaskResult, TaskStatus};
pub use hash_cache::FileHashCache;
pub use incremental::DoneRecord;
pub use kinds::{CacheInputs, CacheOutputs, ShellTask, TaskContext, TaskKind, TaskKindRegistry, TscTask};
pub use reporter::{
    CacheSource, CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry,
    TracingReporter,
};
pub use scheduler::{RunSummary, SchedulerOptions, TaskScheduler};
pub use task::{TaskCommand, TaskDefinition, TaskId, TaskReference};
