//! Backup command implementation.

use super::Context;
use crate::backup::BackupOptions;
use anyhow::{bail, Result};
use clap::Args;

/// Arguments for the backup command
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Label for this snapshot
    #[arg(short, long)]
    pub label: Option<String>,

    /// Extra source path or glob, added to the configured sources
    #[arg(long, short, action = clap::ArgAction::Append)]
    pub source: Vec<String>,

    /// Extra exclude pattern (glob-style)
    #[arg(long, action = clap::ArgAction::Append)]
    pub exclude: Vec<String>,
}

/// Run the backup command
pub fn run(args: BackupArgs, ctx: &Context) -> Result<()> {
    let mut sources = ctx.config.as_ref().map(|c| c.sources.clone()).unwrap_or_default();
    sources.extend(args.source);
    let mut excludes = ctx.config.as_ref().map(|c| c.excludes.clone()).unwrap_or_default();
    excludes.extend(args.exclude);
    if sources.is_empty() {
        bail!("Nothing to back up: no sources in the config file or on the command line");
    }
    if let Some(config) = &ctx.config {
        config.validate()?;
    }

    let repo = ctx.open_repository()?;
    let options = BackupOptions {
        follow_symlinks: ctx.config.as_ref().map_or(false, |c| c.follow_symlinks),
        label: args.label,
        ..BackupOptions::default()
    };
    let outcome = repo.backup_with(&sources, &excludes, options)?;
    let report = &outcome.report;

    println!("Backup completed successfully!");
    println!("  Snapshot ID: {}", outcome.id);
    println!("  Files backed up: {}", report.files);
    println!("  Total size: {} bytes", report.bytes);
    println!("  Chunks: {} ({} new, {} bytes written)", report.chunks, report.new_chunks, report.new_bytes);
    println!("  Excluded: {}", report.excluded);
    println!("  Symlinks and special files skipped: {}", report.not_regular);
    println!("  Duration: {:?}", report.duration);

    if report.is_partial() {
        println!("\nSkipped:");
        for skipped in &report.skipped {
            println!("  {}: {}", skipped.path.display(), skipped.reason);
        }
    }

    Ok(())
}
