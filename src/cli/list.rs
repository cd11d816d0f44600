//! List command implementation.

use super::{Context, OutputFormat};
use anyhow::Result;
use clap::Args;

/// Arguments for the list command
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Run the list command
pub fn run(args: ListArgs, ctx: &Context) -> Result<()> {
    let repo = ctx.open_repository()?;
    let snapshots = repo.list();

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<8} {:<20} {:<20} {:>8} {:>14}",
                "ID", "Created", "Label", "Files", "Size"
            );
            println!("{:-<74}", "");
            for snapshot in &snapshots {
                println!(
                    "{:<8} {:<20} {:<20} {:>8} {:>14}",
                    snapshot.id,
                    snapshot.created.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.label.as_deref().unwrap_or("-"),
                    snapshot.file_count,
                    snapshot.total_size
                );
            }
        }
    }

    Ok(())
}
