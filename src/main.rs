//! snapvault command-line entry point

use clap::Parser;
use snapvault::cli::Cli;
use snapvault::logging::init_logging;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.quiet, cli.log_format)?;

    cli.run()
}
