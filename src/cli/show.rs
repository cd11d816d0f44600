//! Show command implementation.

use super::{Context, OutputFormat};
use crate::manifest::SnapshotId;
use anyhow::{Context as _, Result};
use clap::Args;

/// Arguments for the show command
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Snapshot ID, or `latest`
    pub snapshot_id: String,

    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// List every file instead of the first ten
    #[arg(long)]
    pub all: bool,
}

/// Run the show command
pub fn run(args: ShowArgs, ctx: &Context) -> Result<()> {
    let repo = ctx.open_repository()?;
    let id = resolve_id(&args.snapshot_id, || repo.list().last().map(|s| s.id))?;
    let snapshot = repo.show(id)?;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        OutputFormat::Table => {
            println!("Snapshot Details:");
            println!("  ID: {}", snapshot.id);
            println!("  Created: {}", snapshot.created);
            println!("  Label: {}", snapshot.label.as_deref().unwrap_or("-"));
            if let Some(parent) = snapshot.parent {
                println!("  Parent: {}", parent);
            }
            println!("  Files: {}", snapshot.files.len());
            println!("  Unique chunks: {}", snapshot.unique_chunks().len());
            println!("  Total Size: {} bytes", snapshot.total_size());

            let shown = if args.all {
                snapshot.files.len()
            } else {
                snapshot.files.len().min(10)
            };
            if shown > 0 {
                println!("\nFiles:");
                for file in &snapshot.files[..shown] {
                    println!("  {} ({} bytes)", file.path.display(), file.size);
                }
                if snapshot.files.len() > shown {
                    println!("  ... and {} more files", snapshot.files.len() - shown);
                }
            }
        }
    }

    Ok(())
}

/// Parse a snapshot argument, accepting `latest`
pub(crate) fn resolve_id(arg: &str, latest: impl FnOnce() -> Option<SnapshotId>) -> Result<SnapshotId> {
    if arg.eq_ignore_ascii_case("latest") {
        return latest().context("Repository has no snapshots");
    }
    Ok(arg.parse::<SnapshotId>()?)
}
