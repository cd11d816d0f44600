//! Repository facade: on-disk layout, key setup and the user-level operations

use crate::backup::{BackupOptions, BackupOrchestrator, BackupOutcome};
use crate::chunk::{ChunkCodec, ChunkRef, ContentStore, GcReport, DEFAULT_CHUNK_SIZE};
use crate::config::{Config, KdfParams};
use crate::manifest::{Snapshot, SnapshotId, SnapshotSummary};
use crate::restore::{RestoreEngine, RestoreReport};
use crate::retention::{self, RetentionRule};
use crate::snapshot::SnapshotManager;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, span, warn, Level};
use uuid::Uuid;

#[cfg(feature = "encryption")]
use crate::crypto::{self, MasterKey};
#[cfg(feature = "encryption")]
use std::sync::Arc;

/// Repository config format version
pub const REPO_VERSION: u32 = 1;

const CONFIG_FILE: &str = "repo.json";

/// Key derivation inputs stored with an encrypted repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Hex-encoded Argon2id salt
    pub salt: String,
    pub kdf: KdfParams,
    /// Keyed hash of a fixed context string, compared on open
    pub key_check: String,
}

/// Contents of `repo.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: Uuid,
    pub version: u32,
    pub created: DateTime<Utc>,
    /// Fixed for the repository's lifetime so block boundaries stay stable
    pub chunk_size: usize,
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
}

/// Parameters for [`Repository::init`]
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub chunk_size: usize,
    pub kdf: KdfParams,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            kdf: KdfParams::default(),
        }
    }
}

impl From<&Config> for InitOptions {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            kdf: config.kdf,
        }
    }
}

/// Outcome of a prune pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub pruned: Vec<SnapshotId>,
    pub kept: Vec<SnapshotId>,
    pub chunks_deleted: usize,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

/// Outcome of a consistency check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckReport {
    pub snapshots_checked: usize,
    pub chunks_checked: usize,
    /// Referenced chunks with no file on disk or no index entry
    pub missing: Vec<ChunkRef>,
    /// Chunks failing authentication or hash verification
    pub corrupt: Vec<ChunkRef>,
    /// Chunks whose persisted count disagrees with the snapshots
    pub refcount_mismatches: Vec<ChunkRef>,
    /// Stored chunk files no snapshot references
    pub orphans: usize,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty() && self.refcount_mismatches.is_empty()
    }
}

/// An opened repository
#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    config: RepoConfig,
    store: ContentStore,
    manager: SnapshotManager,
}

impl Repository {
    /// Create a new repository at `path`.
    ///
    /// With a passphrase the repository is encrypted; the salt and KDF
    /// parameters are stored in `repo.json`, never the key.
    pub fn init<P: AsRef<Path>>(path: P, options: &InitOptions, passphrase: Option<&str>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let span = span!(Level::INFO, "init", repo = %root.display());
        let _enter = span.enter();

        if options.chunk_size == 0 {
            return Err(Error::Configuration {
                reason: "chunk_size must be greater than 0".to_string(),
            });
        }
        if root.join(CONFIG_FILE).exists() {
            return Err(Error::InvalidRepository {
                reason: format!("Repository already initialised at {}", root.display()),
            });
        }

        fs::create_dir_all(&root).map_err(|e| Error::storage("creating repository", e))?;

        let (encryption, codec) = match passphrase {
            Some(passphrase) => {
                let (encryption, codec) = new_encryption(passphrase, &options.kdf)?;
                (Some(encryption), codec)
            }
            None => (None, ChunkCodec::Plain),
        };

        let config = RepoConfig {
            id: Uuid::new_v4(),
            version: REPO_VERSION,
            created: Utc::now(),
            chunk_size: options.chunk_size,
            encryption,
        };
        write_config(&root, &config)?;

        let manager = SnapshotManager::create(&root)?;
        let store = ContentStore::open(&root, codec, &manager.index().chunks)?;

        info!(
            "Initialised repository {} (encrypted: {})",
            config.id,
            config.encryption.is_some()
        );
        Ok(Self {
            root,
            config,
            store,
            manager,
        })
    }

    /// Open an existing repository; encrypted repositories need the passphrase
    pub fn open<P: AsRef<Path>>(path: P, passphrase: Option<&str>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let config = read_config(&root)?;
        if config.version != REPO_VERSION {
            return Err(Error::InvalidRepository {
                reason: format!(
                    "Unsupported repository version: {} (expected {})",
                    config.version, REPO_VERSION
                ),
            });
        }

        let codec = match &config.encryption {
            Some(encryption) => unlock(encryption, passphrase)?,
            None => {
                if passphrase.is_some() {
                    warn!("Repository is not encrypted; ignoring passphrase");
                }
                ChunkCodec::Plain
            }
        };

        let manager = SnapshotManager::open(&root)?;
        let store = ContentStore::open(&root, codec, &manager.index().chunks)?;

        Ok(Self {
            root,
            config,
            store,
            manager,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn manager(&self) -> &SnapshotManager {
        &self.manager
    }

    /// Back up the sources in `config`
    pub fn backup(&self, config: &Config) -> Result<BackupOutcome> {
        if config.chunk_size != self.config.chunk_size {
            warn!(
                "Configured chunk size {} differs from the repository's {}; using the repository's",
                config.chunk_size, self.config.chunk_size
            );
        }
        let options = BackupOptions {
            follow_symlinks: config.follow_symlinks,
            ..BackupOptions::default()
        };
        self.backup_with(&config.sources, &config.excludes, options)
    }

    /// Back up with explicit options; the chunk size always comes from the
    /// repository config
    pub fn backup_with<S: AsRef<str>>(
        &self,
        sources: &[S],
        excludes: &[S],
        options: BackupOptions,
    ) -> Result<BackupOutcome> {
        let options = BackupOptions {
            chunk_size: self.config.chunk_size,
            ..options
        };

        BackupOrchestrator::new(options).run(sources, excludes, &self.store, &self.manager)
    }

    /// Snapshot summaries, oldest first
    pub fn list(&self) -> Vec<SnapshotSummary> {
        self.manager.summaries()
    }

    pub fn show(&self, id: SnapshotId) -> Result<Snapshot> {
        self.manager.get(id)
    }

    /// Apply a retention rule, then collect garbage unless `dry_run`
    pub fn prune(&self, rule: &RetentionRule, now: DateTime<Utc>, dry_run: bool) -> Result<PruneReport> {
        let span = span!(Level::INFO, "prune", dry_run);
        let _enter = span.enter();

        let selection = retention::select(&self.manager.list(), rule, now)?;
        let mut report = PruneReport {
            pruned: selection.prune.iter().copied().collect(),
            kept: selection.keep.iter().copied().collect(),
            dry_run,
            ..PruneReport::default()
        };

        if dry_run {
            info!(
                "Dry run: would prune {} snapshots, keep {}",
                report.pruned.len(),
                report.kept.len()
            );
            return Ok(report);
        }

        if !report.pruned.is_empty() {
            let removed = self.manager.remove(&report.pruned, &self.store)?;
            report.pruned = removed.iter().map(|s| s.id).collect();
        }
        let gc = self.manager.collect_garbage(&self.store)?;
        report.chunks_deleted = gc.chunks_removed;
        report.bytes_freed = gc.bytes_freed;

        info!(
            "Pruned {} snapshots, kept {}, freed {} bytes",
            report.pruned.len(),
            report.kept.len(),
            report.bytes_freed
        );
        Ok(report)
    }

    /// Delete unreferenced chunk files
    pub fn gc(&self) -> Result<GcReport> {
        self.manager.collect_garbage(&self.store)
    }

    /// Verify every referenced chunk is present and authentic
    pub fn check(&self) -> Result<CheckReport> {
        let span = span!(Level::INFO, "check");
        let _enter = span.enter();

        let index = self.manager.index();
        let mut report = CheckReport {
            snapshots_checked: index.snapshots.len(),
            ..CheckReport::default()
        };

        let mut expected: BTreeMap<&ChunkRef, u64> = BTreeMap::new();
        for snapshot in &index.snapshots {
            for chunk in snapshot.chunk_refs() {
                *expected.entry(chunk).or_insert(0) += 1;
            }
        }

        for (chunk, &count) in &expected {
            report.chunks_checked += 1;
            match index.chunks.get(*chunk) {
                Some(entry) if entry.refs != count => report.refcount_mismatches.push((*chunk).clone()),
                None => {
                    report.missing.push((*chunk).clone());
                    continue;
                }
                _ => {}
            }

            match self.store.verify(chunk) {
                Ok(()) => {}
                Err(Error::NotFound { .. }) => report.missing.push((*chunk).clone()),
                Err(Error::Integrity { reason }) => {
                    warn!("Chunk {} failed verification: {}", chunk, reason);
                    report.corrupt.push((*chunk).clone());
                }
                Err(e) => return Err(e),
            }
        }

        for chunk in index.chunks.keys() {
            if !expected.contains_key(chunk) {
                report.refcount_mismatches.push(chunk.clone());
            }
        }

        report.orphans = self
            .store
            .list_stored()?
            .iter()
            .filter(|chunk| !expected.contains_key(chunk))
            .count();

        if report.is_ok() {
            info!(
                "Check passed: {} snapshots, {} chunks",
                report.snapshots_checked, report.chunks_checked
            );
        } else {
            warn!(
                "Check found {} missing, {} corrupt, {} miscounted chunks",
                report.missing.len(),
                report.corrupt.len(),
                report.refcount_mismatches.len()
            );
        }
        Ok(report)
    }

    /// Restore a snapshot, optionally limited to paths matching `filter`
    pub fn restore<P: AsRef<Path>, S: AsRef<str>>(
        &self,
        id: SnapshotId,
        target: P,
        filter: &[S],
    ) -> Result<RestoreReport> {
        RestoreEngine::new(&self.store, &self.manager).restore_filtered(id, target, filter)
    }
}

fn read_config(root: &Path) -> Result<RepoConfig> {
    let path = root.join(CONFIG_FILE);
    let file = File::open(&path).map_err(|e| Error::InvalidRepository {
        reason: format!("Not a repository ({}): {}", path.display(), e),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn write_config(root: &Path, config: &RepoConfig) -> Result<()> {
    let path = root.join(CONFIG_FILE);
    let tmp_path = path.with_extension("json.tmp");

    let mut file = File::create(&tmp_path).map_err(|e| Error::storage("creating repository config", e))?;
    serde_json::to_writer_pretty(&mut file, config)?;
    file.write_all(b"\n")?;
    file.sync_all()
        .map_err(|e| Error::storage("syncing repository config", e))?;
    fs::rename(&tmp_path, &path).map_err(|e| Error::storage("writing repository config", e))?;
    Ok(())
}

#[cfg(feature = "encryption")]
fn new_encryption(passphrase: &str, kdf: &KdfParams) -> Result<(EncryptionConfig, ChunkCodec)> {
    kdf.validate()?;
    let salt = crypto::generate_salt();
    let key = MasterKey::derive(passphrase.as_bytes(), &salt, kdf)?;

    let encryption = EncryptionConfig {
        salt: hex::encode(salt),
        kdf: *kdf,
        key_check: key.key_check(),
    };
    Ok((encryption, ChunkCodec::Sealed(Arc::new(key))))
}

#[cfg(not(feature = "encryption"))]
fn new_encryption(_passphrase: &str, _kdf: &KdfParams) -> Result<(EncryptionConfig, ChunkCodec)> {
    Err(Error::Configuration {
        reason: "snapvault was built without the `encryption` feature".to_string(),
    })
}

#[cfg(feature = "encryption")]
fn unlock(encryption: &EncryptionConfig, passphrase: Option<&str>) -> Result<ChunkCodec> {
    let passphrase = passphrase.ok_or_else(|| Error::Authentication {
        reason: "repository is encrypted and no passphrase was given".to_string(),
    })?;
    let salt = hex::decode(&encryption.salt).map_err(|e| Error::InvalidRepository {
        reason: format!("Malformed salt: {}", e),
    })?;

    let key = MasterKey::derive(passphrase.as_bytes(), &salt, &encryption.kdf)?;
    if key.key_check() != encryption.key_check {
        return Err(Error::Authentication {
            reason: "wrong passphrase".to_string(),
        });
    }
    Ok(ChunkCodec::Sealed(Arc::new(key)))
}

#[cfg(not(feature = "encryption"))]
fn unlock(_encryption: &EncryptionConfig, _passphrase: Option<&str>) -> Result<ChunkCodec> {
    Err(Error::Configuration {
        reason: "repository is encrypted but snapvault was built without the `encryption` feature"
            .to_string(),
    })
}
