//! Init command implementation.

use super::{passphrase, Context, PASSPHRASE_ENV};
use crate::repository::{InitOptions, Repository};
use anyhow::{bail, Result};
use clap::Args;

/// Arguments for the init command
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Encrypt the repository with the passphrase from SNAPVAULT_PASSPHRASE
    #[arg(long)]
    pub encrypt: bool,

    /// Chunk size in bytes, overriding the config file
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

/// Run the init command
pub fn run(args: InitArgs, ctx: &Context) -> Result<()> {
    let path = ctx.repo_path()?;

    let mut options = ctx.config.as_ref().map(InitOptions::from).unwrap_or_default();
    if let Some(chunk_size) = args.chunk_size {
        options.chunk_size = chunk_size;
    }

    let passphrase = if args.encrypt {
        match passphrase() {
            Some(passphrase) => Some(passphrase),
            None => bail!("--encrypt needs a passphrase in {}", PASSPHRASE_ENV),
        }
    } else {
        None
    };

    let repo = Repository::init(&path, &options, passphrase.as_deref())?;

    println!("Initialised repository at {}", path.display());
    println!("  ID: {}", repo.config().id);
    println!("  Chunk size: {} bytes", repo.config().chunk_size);
    println!("  Encrypted: {}", repo.config().encryption.is_some());
    Ok(())
}
