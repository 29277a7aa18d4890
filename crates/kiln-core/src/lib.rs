//! Kiln Core - configuration and workspace model
//!
//! This crate provides the error types, configuration loading and the
//! workspace/package model that the task graph and the shared cache are
//! built on.

pub mod config;
pub mod error;
pub mod monorepo;

pub use error::{ConfigError, GraphError, KilnError, Result};
pub use monorepo::detector::{WorkspaceDetector, WorkspaceDetectorRegistry};
