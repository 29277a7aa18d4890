//! CLI commands

mod cache;
mod run;

pub use cache::CacheCommand;
pub use run::{RunCommand, TasksFailed};
