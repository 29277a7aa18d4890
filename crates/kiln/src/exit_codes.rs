//! Exit codes for the CLI

use kiln_core::KilnError;
use kiln_tasks::{DagError, DefinitionError};

use crate::cli::commands::TasksFailed;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// Cyclic task dependencies
pub const CYCLE_ERROR: i32 = 3;

/// One or more tasks failed
pub const TASK_FAILED: i32 = 4;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Exit code for an error returned by a command
pub fn for_error(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<TasksFailed>().is_some() {
        return TASK_FAILED;
    }
    if let Some(dag) = error.downcast_ref::<DagError>() {
        return match dag {
            DagError::Cycle(_) => CYCLE_ERROR,
            _ => CONFIG_ERROR,
        };
    }
    if error.downcast_ref::<DefinitionError>().is_some() {
        return CONFIG_ERROR;
    }
    if error.downcast_ref::<dialoguer::Error>().is_some() {
        return CANCELLED;
    }
    match error.downcast_ref::<KilnError>() {
        Some(e) if e.is_config() => CONFIG_ERROR,
        _ => ERROR,
    }
}
