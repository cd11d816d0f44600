//! Snapshot records and the persisted repository index

use crate::chunk::{ChunkEntry, ChunkRef};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Index format version
pub const INDEX_VERSION: u32 = 1;

/// Monotonic snapshot identifier, assigned at commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(SnapshotId)
            .map_err(|_| Error::Configuration {
                reason: format!("Invalid snapshot ID: {}", s),
            })
    }
}

/// A file record in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Archive path: the source path with its root stripped
    pub path: PathBuf,
    /// File permissions (Unix-style)
    pub mode: Option<u32>,
    /// File modification time
    pub modified: Option<DateTime<Utc>>,
    /// Ordered list of chunks that make up this file
    pub chunks: Vec<ChunkRef>,
    /// File size in bytes
    pub size: u64,
}

/// Immutable point-in-time record of a file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub label: Option<String>,
    /// Newest snapshot at the time this one was committed
    #[serde(default)]
    pub parent: Option<SnapshotId>,
    /// File records sorted by path
    pub files: Vec<FileEntry>,
}

impl Snapshot {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Every chunk occurrence, in file order
    pub fn chunk_refs(&self) -> impl Iterator<Item = &ChunkRef> {
        self.files.iter().flat_map(|f| f.chunks.iter())
    }

    /// Get all unique chunks referenced by this snapshot
    pub fn unique_chunks(&self) -> Vec<&ChunkRef> {
        let mut seen = HashSet::new();
        self.chunk_refs().filter(|c| seen.insert(*c)).collect()
    }

    /// Find a file record by path
    pub fn find_file<P: AsRef<Path>>(&self, path: P) -> Option<&FileEntry> {
        let path = path.as_ref();
        self.files.iter().find(|f| f.path == path)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            created: self.created,
            label: self.label.clone(),
            parent: self.parent,
            file_count: self.files.len(),
            total_size: self.total_size(),
        }
    }
}

/// Listing view of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub created: DateTime<Utc>,
    pub label: Option<String>,
    pub parent: Option<SnapshotId>,
    pub file_count: usize,
    pub total_size: u64,
}

/// Persisted chunk table and snapshot list.
///
/// Replaced copy-on-write: a new value is written beside the old file and
/// renamed over it, so a reader never observes a half-written index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    pub version: u32,
    pub next_id: u64,
    pub chunks: BTreeMap<ChunkRef, ChunkEntry>,
    /// Snapshots ordered by id, newest last
    pub snapshots: Vec<Snapshot>,
}

impl Default for RepositoryIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            next_id: 1,
            chunks: BTreeMap::new(),
            snapshots: Vec::new(),
        }
    }
}

impl RepositoryIndex {
    /// Load an index file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::InvalidRepository {
            reason: format!("Cannot open index {}: {}", path.display(), e),
        })?;

        let index: RepositoryIndex = serde_json::from_reader(BufReader::new(file))?;
        if index.version != INDEX_VERSION {
            return Err(Error::InvalidRepository {
                reason: format!(
                    "Unsupported index version: {} (expected {})",
                    index.version, INDEX_VERSION
                ),
            });
        }

        Ok(index)
    }

    /// Write to a sibling temp file, fsync, then rename over `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("json.tmp");

        let file = File::create(&tmp_path).map_err(|e| Error::storage("creating index", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush().map_err(|e| Error::storage("writing index", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::storage("syncing index", e))?;
        drop(writer);

        fs::rename(&tmp_path, path).map_err(|e| Error::storage("replacing index", e))?;
        sync_parent_dir(path);

        Ok(())
    }

    pub fn snapshot(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|pos| &self.snapshots[pos])
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Append a snapshot and add one persisted reference per chunk occurrence
    pub(crate) fn append(&mut self, snapshot: Snapshot, sizes: impl Fn(&ChunkRef) -> Option<ChunkEntry>) {
        for chunk in snapshot.chunk_refs() {
            let entry = self.chunks.entry(chunk.clone()).or_insert_with(|| {
                let known = sizes(chunk).unwrap_or(ChunkEntry {
                    size: 0,
                    stored_size: 0,
                    refs: 0,
                });
                ChunkEntry { refs: 0, ..known }
            });
            entry.refs += 1;
        }
        self.next_id = self.next_id.max(snapshot.id.0 + 1);
        self.snapshots.push(snapshot);
    }

    /// Remove a snapshot, dropping its persisted references
    pub(crate) fn remove(&mut self, id: SnapshotId) -> Option<Snapshot> {
        let pos = self.snapshots.binary_search_by_key(&id, |s| s.id).ok()?;
        let snapshot = self.snapshots.remove(pos);

        for chunk in snapshot.chunk_refs() {
            if let Some(entry) = self.chunks.get_mut(chunk) {
                entry.refs = entry.refs.saturating_sub(1);
            }
        }
        self.chunks.retain(|_, entry| entry.refs > 0);

        Some(snapshot)
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
