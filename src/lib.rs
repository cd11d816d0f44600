//! # snapvault
//!
//! Snapshot backups for local file trees with fixed-size chunking, BLAKE3
//! content addressing and optional ChaCha20-Poly1305 encryption at rest.
//!
//! ## Features
//!
//! - **Content store**: deduplicated, reference-counted chunk files
//! - **Snapshots**: atomic copy-on-write commits of a repository index
//! - **Retention**: calendar-aligned daily, weekly and monthly pruning
//! - **Restore**: full or glob-filtered reconstruction of a snapshot
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapvault::config::Config;
//! use snapvault::repository::{InitOptions, Repository};
//!
//! # fn main() -> snapvault::Result<()> {
//! let repo = Repository::init("./backup-repo", &InitOptions::default(), None)?;
//!
//! let mut config = Config::new("./backup-repo");
//! config.sources.push("./my-data".to_string());
//!
//! let outcome = repo.backup(&config)?;
//! println!("Backup completed: snapshot {}", outcome.id);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod chunk;
pub mod cli;
pub mod config;
#[cfg(feature = "encryption")]
pub mod crypto;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod repository;
pub mod restore;
pub mod retention;
pub mod snapshot;

// Re-export commonly used types
pub use backup::{BackupOptions, BackupOrchestrator, BackupOutcome, BackupReport};
pub use chunk::{ChunkRef, ContentStore};
pub use config::Config;
pub use error::{Error, Result};
pub use manifest::{FileEntry, Snapshot, SnapshotId};
pub use repository::Repository;
pub use restore::{RestoreEngine, RestoreReport};
pub use retention::{RetentionRule, Selection};
pub use snapshot::{SnapshotBuilder, SnapshotManager};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
