//! Restore command implementation.

use super::show::resolve_id;
use super::Context;
use anyhow::{bail, Result};
use clap::Args;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Arguments for the restore command
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Snapshot ID to restore, or `latest`
    pub snapshot_id: String,

    /// Target directory for restore
    #[arg(long, short)]
    pub target: PathBuf,

    /// Only restore archive paths matching this glob (repeatable)
    #[arg(long, action = clap::ArgAction::Append)]
    pub include: Vec<String>,

    /// Allow writing into a non-empty target, overwriting existing files
    #[arg(long)]
    pub overwrite: bool,
}

/// Run the restore command; a partial restore exits non-zero after the summary
pub fn run(args: RestoreArgs, ctx: &Context) -> Result<()> {
    if !args.overwrite && !is_empty_dir(&args.target)? {
        bail!(
            "Target {} is not empty; pass --overwrite to restore into it",
            args.target.display()
        );
    }

    let repo = ctx.open_repository()?;
    let id = resolve_id(&args.snapshot_id, || repo.list().last().map(|s| s.id))?;
    let report = repo.restore(id, &args.target, &args.include)?;
    info!("Restore completed");

    println!("Files restored: {}", report.files_restored);
    println!("Files skipped: {}", report.skipped.len());
    println!("Bytes written: {}", report.bytes_written);
    println!("Duration: {:?}", report.duration);
    if report.is_partial() {
        println!("\nErrors:");
        for skipped in &report.skipped {
            println!("  {}: {}", skipped.path.display(), skipped.reason);
        }
    }

    report.into_result()?;
    Ok(())
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_empty_dir() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(is_empty_dir(temp_dir.path())?);
        assert!(is_empty_dir(&temp_dir.path().join("missing"))?);

        fs::write(temp_dir.path().join("file"), b"x")?;
        assert!(!is_empty_dir(temp_dir.path())?);
        Ok(())
    }
}
