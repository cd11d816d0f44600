//! Prune command implementation.

use super::{Context, OutputFormat};
use crate::retention::RetentionRule;
use anyhow::Result;
use chrono::Utc;
use clap::Args;

/// Arguments for the prune command
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Daily snapshots to keep, overriding the config file
    #[arg(long)]
    pub keep_daily: Option<u32>,

    /// Weekly snapshots to keep, overriding the config file
    #[arg(long)]
    pub keep_weekly: Option<u32>,

    /// Monthly snapshots to keep, overriding the config file
    #[arg(long)]
    pub keep_monthly: Option<u32>,

    /// Report what would be pruned without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

impl PruneArgs {
    fn rule(&self, base: RetentionRule) -> RetentionRule {
        RetentionRule {
            keep_daily: self.keep_daily.unwrap_or(base.keep_daily),
            keep_weekly: self.keep_weekly.unwrap_or(base.keep_weekly),
            keep_monthly: self.keep_monthly.unwrap_or(base.keep_monthly),
        }
    }
}

/// Run the prune command
pub fn run(args: PruneArgs, ctx: &Context) -> Result<()> {
    let base = ctx.config.as_ref().map(|c| c.retention).unwrap_or_default();
    let rule = args.rule(base);

    let repo = ctx.open_repository()?;
    let report = repo.prune(&rule, Utc::now(), args.dry_run)?;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            let verb = if report.dry_run { "Would prune" } else { "Pruned" };
            println!(
                "Retention: {} daily, {} weekly, {} monthly",
                rule.keep_daily, rule.keep_weekly, rule.keep_monthly
            );
            println!("  Kept: {} snapshots", report.kept.len());
            println!("  {}: {} snapshots", verb, report.pruned.len());
            for id in &report.pruned {
                println!("    {}", id);
            }
            if !report.dry_run {
                println!("  Chunks deleted: {}", report.chunks_deleted);
                println!("  Bytes freed: {}", report.bytes_freed);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = PruneArgs {
            keep_daily: Some(2),
            keep_weekly: None,
            keep_monthly: Some(0),
            dry_run: false,
            format: OutputFormat::Table,
        };
        assert_eq!(args.rule(RetentionRule::new(7, 4, 6)), RetentionRule::new(2, 4, 0));
    }
}
