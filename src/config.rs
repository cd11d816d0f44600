//! TOML configuration for backup runs

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::retention::RetentionRule;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Argon2id cost parameters for passphrase derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of passes over memory
    pub time_cost: u32,
    /// Memory in KiB
    pub memory_cost: u32,
    /// Degree of parallelism (lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_cost: 64 * 1024,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn validate(&self) -> Result<()> {
        if self.time_cost == 0 || self.parallelism == 0 {
            return Err(Error::Configuration {
                reason: "KDF time_cost and parallelism must be at least 1".to_string(),
            });
        }
        if self.memory_cost < 8 * self.parallelism {
            return Err(Error::Configuration {
                reason: format!(
                    "KDF memory_cost must be at least 8 KiB per lane ({} KiB for {} lanes)",
                    8 * self.parallelism,
                    self.parallelism
                ),
            });
        }
        Ok(())
    }
}

/// Backup configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Repository directory
    pub repository: PathBuf,
    /// Source paths or glob patterns to back up
    #[serde(default)]
    pub sources: Vec<String>,
    /// Glob patterns removed from the file set
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Chunk size used when the repository is initialised
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Whether directory walks follow symbolic links
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub kdf: KdfParams,
    #[serde(default)]
    pub retention: RetentionRule,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Config {
    /// Minimal config pointing at a repository
    pub fn new<P: Into<PathBuf>>(repository: P) -> Self {
        Self {
            repository: repository.into(),
            sources: Vec::new(),
            excludes: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            follow_symlinks: false,
            kdf: KdfParams::default(),
            retention: RetentionRule::default(),
        }
    }

    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| Error::Configuration {
            reason: format!("Failed to read config file {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| Error::Configuration {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(config_dir.join("snapvault").join("config.toml"))
    }

    /// Validate config settings
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Configuration {
                reason: "At least one source path is required".to_string(),
            });
        }

        if self.chunk_size == 0 {
            return Err(Error::Configuration {
                reason: "chunk_size must be greater than 0".to_string(),
            });
        }

        for pattern in self.sources.iter().chain(&self.excludes) {
            glob::Pattern::new(pattern)?;
        }

        for source in &self.sources {
            if !Path::new(source).is_absolute() {
                warn!("Source path is relative to the working directory: {}", source);
            }
        }

        self.kdf.validate()?;
        self.retention.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
repository = "/var/backups/snapvault"
sources = ["/home/alice", "/etc/*.conf"]
excludes = ["**/cache/*", "*.tmp"]

[kdf]
time_cost = 2
memory_cost = 19456
parallelism = 1

[retention]
keep_daily = 7
keep_weekly = 4
keep_monthly = 2
"#;

    #[test]
    fn test_parse_full_config() -> Result<()> {
        let config = Config::from_toml_str(SAMPLE)?;

        assert_eq!(config.repository, PathBuf::from("/var/backups/snapvault"));
        assert_eq!(config.sources, vec!["/home/alice", "/etc/*.conf"]);
        assert_eq!(config.excludes, vec!["**/cache/*", "*.tmp"]);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            config.kdf,
            KdfParams {
                time_cost: 2,
                memory_cost: 19456,
                parallelism: 1,
            }
        );
        assert_eq!(config.retention, RetentionRule::new(7, 4, 2));
        config.validate()?;

        Ok(())
    }

    #[test]
    fn test_defaults_apply() -> Result<()> {
        let config = Config::from_toml_str("repository = \"/r\"\nsources = [\"/data\"]\n")?;

        assert_eq!(config.kdf, KdfParams::default());
        assert_eq!(config.retention, RetentionRule::default());
        assert!(!config.follow_symlinks);
        config.validate()?;

        Ok(())
    }

    #[test]
    fn test_validation_failures() -> Result<()> {
        let mut config = Config::new("/r");
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        config.sources.push("/data".to_string());
        config.chunk_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        config.chunk_size = 4096;
        config.kdf.memory_cost = 4;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        config.kdf = KdfParams::default();
        config.retention = RetentionRule::new(0, 0, 0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidRetentionRule { .. })
        ));

        config.retention = RetentionRule::default();
        config.excludes.push("[unclosed".to_string());
        assert!(matches!(config.validate(), Err(Error::Glob(_))));

        Ok(())
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Config::from_toml_str("repository = 5"),
            Err(Error::TomlParse(_))
        ));
    }
}
