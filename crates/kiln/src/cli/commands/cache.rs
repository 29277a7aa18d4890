//! Cache management command

use clap::{Args, Subcommand};
use console::style;

use kiln_cache::{format_bytes, SharedCache};

use crate::cli::context::Context;
use crate::cli::output::{self, header, key_value, path_style, plural};
use crate::cli::{Cli, OutputFormat};

/// Shared build cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Stats,

    /// Remove every cache entry
    Clean {
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Remove expired entries, then the oldest until under the size limit
    Prune {
        /// Size limit in megabytes (defaults to cache.max_size_mb)
        #[arg(long)]
        max_size_mb: Option<u64>,

        /// Maximum entry age in days (defaults to cache.max_age_days)
        #[arg(long)]
        max_age_days: Option<u64>,
    },

    /// Check every entry against its recorded hashes
    Verify {
        /// Delete entries that fail verification
        #[arg(long)]
        fix: bool,
    },
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let context = Context::load(cli)?;
        let cache = context.require_cache()?;

        let modifies = match &self.action {
            CacheAction::Stats => false,
            CacheAction::Verify { fix } => *fix,
            CacheAction::Clean { .. } | CacheAction::Prune { .. } => true,
        };
        if modifies && cache.settings().read_only {
            anyhow::bail!(
                "Cache at {} is read-only; refusing to modify it",
                cache.settings().root.display()
            );
        }

        let result = match &self.action {
            CacheAction::Stats => stats(&cache, cli),
            CacheAction::Clean { yes } => clean(&cache, cli, *yes),
            CacheAction::Prune {
                max_size_mb,
                max_age_days,
            } => prune(&cache, cli, *max_size_mb, *max_age_days),
            CacheAction::Verify { fix } => verify(&cache, cli, *fix),
        };

        cache.flush_statistics();
        result
    }
}

fn stats(cache: &SharedCache, cli: &Cli) -> anyhow::Result<()> {
    let stats = cache.statistics();
    let settings = cache.settings();

    if cli.format == OutputFormat::Json {
        let result = serde_json::json!({
            "cacheDir": settings.root.display().to_string(),
            "readOnly": settings.read_only,
            "hitRate": stats.hit_rate(),
            "statistics": stats,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if cli.quiet {
        return Ok(());
    }

    let last_pruned = stats
        .last_pruned
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "never".to_string());

    println!("{}", header("Shared Cache"));
    println!();
    println!(
        "{}",
        key_value("Location", &path_style().apply_to(settings.root.display()).to_string())
    );
    if settings.read_only {
        println!("{}", key_value("Mode", &style("read-only").yellow().to_string()));
    }
    println!("{}", key_value("Entries", &stats.total_entries.to_string()));
    println!("{}", key_value("Size", &format_bytes(stats.total_size)));
    println!(
        "{}",
        key_value(
            "Hit rate",
            &format!(
                "{:.1}% ({} hits, {} misses)",
                stats.hit_rate() * 100.0,
                stats.hit_count,
                stats.miss_count
            )
        )
    );
    println!(
        "{}",
        key_value(
            "Stores",
            &format!("{} (avg {:.0}ms)", stats.store_count, stats.avg_store_time_ms)
        )
    );
    println!(
        "{}",
        key_value(
            "Restores",
            &format!("{} (avg {:.0}ms)", stats.restore_count, stats.avg_restore_time_ms)
        )
    );
    println!("{}", key_value("Last pruned", &last_pruned));

    Ok(())
}

fn clean(cache: &SharedCache, cli: &Cli, yes: bool) -> anyhow::Result<()> {
    let root = cache.settings().root.clone();

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Remove all cached entries at {}?", root.display()))
            .default(false)
            .interact()?;

        if !confirmed {
            if cli.prints_text() {
                println!("{}", style("Aborted.").yellow());
            }
            return Ok(());
        }
    }

    let result = cache.clean()?;

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !cli.quiet {
        output::success(&format!(
            "Removed {} ({}) from {}",
            plural(result.removed_entries, "entry"),
            format_bytes(result.freed_bytes),
            path_style().apply_to(root.display())
        ));
    }

    Ok(())
}

fn prune(
    cache: &SharedCache,
    cli: &Cli,
    max_size_mb: Option<u64>,
    max_age_days: Option<u64>,
) -> anyhow::Result<()> {
    let settings = cache.settings();
    let max_size_bytes = max_size_mb
        .map(|mb| mb.saturating_mul(1024 * 1024))
        .unwrap_or_else(|| settings.max_size_bytes());
    let max_age_days = max_age_days.unwrap_or(settings.max_age_days);

    if cli.prints_text() {
        output::info(&format!(
            "Pruning entries older than {} days or beyond {}...",
            max_age_days,
            format_bytes(max_size_bytes)
        ));
    }

    let result = cache.prune(max_size_bytes, max_age_days)?;

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if !cli.quiet {
        println!(
            "  {} Removed {} of {} entries ({} expired, {} over size), freed {}",
            style("✓").green(),
            result.removed(),
            result.scanned,
            result.removed_by_age,
            result.removed_by_size,
            format_bytes(result.freed_bytes)
        );
        println!(
            "  {} remaining, {}",
            plural(result.remaining_entries, "entry"),
            format_bytes(result.remaining_bytes)
        );
        if result.stale_staging_removed > 0 {
            println!(
                "  {} Cleaned up {}",
                style("·").dim(),
                plural(result.stale_staging_removed, "abandoned staging directory")
            );
        }
        if result.failures > 0 {
            output::warning(&format!(
                "{} could not be removed",
                plural(result.failures, "entry")
            ));
        }
    }

    Ok(())
}

fn verify(cache: &SharedCache, cli: &Cli, fix: bool) -> anyhow::Result<()> {
    let report = cache.verify(fix)?;

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !cli.quiet {
        for entry in &report.corrupt {
            println!(
                "  {} {} {}",
                style("✗").red(),
                entry.key,
                style(&entry.reason).dim()
            );
        }

        if report.corrupt.is_empty() {
            output::success(&format!("All {} entries verified", report.total));
        } else if fix {
            output::warning(&format!(
                "{} of {} entries were corrupt; removed {}",
                report.corrupt.len(),
                report.total,
                report.removed
            ));
        } else {
            output::warning(&format!(
                "{} of {} entries are corrupt (run with --fix to remove them)",
                report.corrupt.len(),
                report.total
            ));
        }
    }

    if !report.corrupt.is_empty() && !fix {
        anyhow::bail!("{} corrupt cache entries", report.corrupt.len());
    }

    Ok(())
}
