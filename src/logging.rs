//! Subscriber setup for the binary

use crate::{Error, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log output format
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` overrides the default level,
/// which is `info`, or `warn` when quiet.
pub fn init_logging(quiet: bool, format: LogFormat) -> Result<()> {
    let level = if quiet { Level::WARN } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let installed = match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
    };

    installed.map_err(|e| Error::Configuration {
        reason: format!("Failed to install log subscriber: {}", e),
    })
}
