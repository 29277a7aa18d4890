//! Monorepo support for multi-package repositories
//!
//! - Workspace detection (Cargo, npm, pnpm, yarn, kiln.toml)
//! - Package discovery with glob patterns
//! - Package dependency graph with topological sorting

pub mod detector;
pub mod discovery;
pub mod graph;
pub mod workspace;

pub use discovery::{DiscoveredPackage, PackageDiscovery};
pub use graph::{DependencyGraph, PackageNode};
pub use workspace::{Workspace, WorkspaceType};
