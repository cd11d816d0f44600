//! Command-line interface for snapvault.
//!
//! Each subcommand lives in its own module with an `Args` struct and a `run`
//! function. Global flags pick the config file, the repository and the log
//! output.

use crate::config::Config;
use crate::logging::LogFormat;
use crate::repository::Repository;
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use tracing::debug;

pub mod backup;
pub mod check;
pub mod init;
pub mod list;
pub mod prune;
pub mod restore;
pub mod show;

/// Environment variable holding the repository passphrase
pub const PASSPHRASE_ENV: &str = "SNAPVAULT_PASSPHRASE";

/// snapvault - deduplicating, encrypting snapshot backups
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: <config dir>/snapvault/config.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Repository directory, overriding the config file
    #[arg(long, short = 'r', global = true, env = "SNAPVAULT_REPO")]
    pub repo: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a new repository
    Init(init::InitArgs),
    /// Back up the configured sources
    Backup(backup::BackupArgs),
    /// List snapshots
    List(list::ListArgs),
    /// Show one snapshot
    Show(show::ShowArgs),
    /// Apply the retention rule and delete unreferenced chunks
    Prune(prune::PruneArgs),
    /// Verify that every referenced chunk is present and intact
    Check(check::CheckArgs),
    /// Restore a snapshot into a directory
    Restore(restore::RestoreArgs),
}

/// Output format for listing commands
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Resolved global settings shared by the subcommands
#[derive(Debug)]
pub struct Context {
    pub config: Option<Config>,
    pub repo: Option<PathBuf>,
}

impl Context {
    /// Load the config file and work out the repository location
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => Some(
                Config::load(path)
                    .with_context(|| format!("loading config {}", path.display()))?,
            ),
            None => {
                let path = Config::default_path()?;
                if path.exists() {
                    Some(Config::load(&path)?)
                } else {
                    debug!("No config file at {}", path.display());
                    None
                }
            }
        };

        let repo = cli
            .repo
            .clone()
            .or_else(|| config.as_ref().map(|c| c.repository.clone()));

        Ok(Self { config, repo })
    }

    pub fn repo_path(&self) -> Result<PathBuf> {
        self.repo.clone().ok_or_else(|| {
            anyhow::anyhow!(
                "No repository specified. Use --repo, SNAPVAULT_REPO or `repository` in the config file"
            )
        })
    }

    /// The config file, required by commands that need sources
    pub fn require_config(&self) -> Result<&Config> {
        self.config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No config file found. Use --config to point at one"))
    }

    pub fn open_repository(&self) -> Result<Repository> {
        let path = self.repo_path()?;
        let passphrase = passphrase();
        Repository::open(&path, passphrase.as_deref())
            .with_context(|| format!("opening repository {}", path.display()))
    }
}

/// Passphrase from the environment, if set and non-empty
pub fn passphrase() -> Option<String> {
    env::var(PASSPHRASE_ENV).ok().filter(|p| !p.is_empty())
}

impl Cli {
    /// Dispatch to the selected subcommand
    pub fn run(self) -> Result<()> {
        let ctx = Context::resolve(&self)?;

        match self.command {
            Commands::Init(args) => init::run(args, &ctx),
            Commands::Backup(args) => backup::run(args, &ctx),
            Commands::List(args) => list::run(args, &ctx),
            Commands::Show(args) => show::run(args, &ctx),
            Commands::Prune(args) => prune::run(args, &ctx),
            Commands::Check(args) => check::run(args, &ctx),
            Commands::Restore(args) => restore::run(args, &ctx),
        }
    }
}
