//! Check command implementation.

use super::{Context, OutputFormat};
use anyhow::{bail, Result};
use clap::Args;

/// Arguments for the check command
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Run the check command; exits non-zero when damage is found
pub fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let repo = ctx.open_repository()?;
    let report = repo.check()?;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("Repository check:");
            println!("  Snapshots: {}", report.snapshots_checked);
            println!("  Chunks verified: {}", report.chunks_checked);
            println!("  Missing: {}", report.missing.len());
            println!("  Corrupt: {}", report.corrupt.len());
            println!("  Reference count mismatches: {}", report.refcount_mismatches.len());
            println!("  Unreferenced chunk files: {}", report.orphans);
            for chunk in &report.missing {
                println!("  missing {}", chunk);
            }
            for chunk in &report.corrupt {
                println!("  corrupt {}", chunk);
            }
        }
    }

    if !report.is_ok() {
        bail!(
            "Repository is damaged: {} missing, {} corrupt chunks",
            report.missing.len(),
            report.corrupt.len()
        );
    }
    Ok(())
}
