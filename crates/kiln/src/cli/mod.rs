//! CLI definition and command handling

pub mod commands;
pub mod context;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use kiln_core::config::CacheOverrides;

use commands::{CacheCommand, RunCommand};

/// Kiln - multi-package build orchestrator with a shared build-output cache
#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Shared cache directory (overrides KILN_CACHE_DIR and the config file)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Read from the shared cache but never write to it
    #[arg(long, global = true)]
    pub cache_read_only: bool,

    /// Re-verify file hashes when restoring from the shared cache
    #[arg(long, global = true)]
    pub cache_verify: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run tasks across the workspace
    Run(RunCommand),

    /// Manage the shared build cache
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Run(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
        }
    }

    /// Cache settings given on the command line
    pub fn cache_overrides(&self) -> CacheOverrides {
        CacheOverrides {
            dir: self.cache_dir.clone(),
            read_only: self.cache_read_only,
            verify_integrity: self.cache_verify,
        }
    }

    /// Whether human-readable progress should be printed
    pub fn prints_text(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}
