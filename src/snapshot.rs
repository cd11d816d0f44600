//! Snapshot lifecycle: accumulation, atomic commit, listing and removal

use crate::chunk::{ChunkRef, ContentStore, GcReport};
use crate::manifest::{FileEntry, RepositoryIndex, Snapshot, SnapshotId, SnapshotSummary};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, span, warn, Level};

const INDEX_FILE: &str = "index.json";
const LOCK_FILE: &str = "lock";

/// Mutable accumulation context for a snapshot that is not yet visible
#[derive(Debug)]
pub struct SnapshotBuilder {
    started: DateTime<Utc>,
    label: Option<String>,
    files: BTreeMap<PathBuf, FileEntry>,
}

impl SnapshotBuilder {
    fn new(started: DateTime<Utc>) -> Self {
        Self {
            started,
            label: None,
            files: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Record a file; its size is settled from chunk sizes at commit
    pub fn add_file(
        &mut self,
        path: impl Into<PathBuf>,
        chunks: Vec<ChunkRef>,
        mode: Option<u32>,
    ) -> Option<FileEntry> {
        self.add_entry(FileEntry {
            path: path.into(),
            mode,
            modified: None,
            chunks,
            size: 0,
        })
    }

    /// Record a file entry, returning the one it displaced at the same path
    pub fn add_entry(&mut self, entry: FileEntry) -> Option<FileEntry> {
        self.files.insert(entry.path.clone(), entry)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    fn chunk_refs(&self) -> impl Iterator<Item = &ChunkRef> {
        self.files.values().flat_map(|f| f.chunks.iter())
    }
}

/// Exclusive writer access: in-process mutex plus the repository lock file
struct WriterGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: File,
}

/// Tracks committed snapshots over a [`ContentStore`].
///
/// Readers get the last committed index as an immutable `Arc` and never
/// block on writers. Commit, removal and garbage collection serialize on the
/// writer lock and re-read the on-disk index under it.
#[derive(Debug)]
pub struct SnapshotManager {
    index_path: PathBuf,
    lock_path: PathBuf,
    current: RwLock<Arc<RepositoryIndex>>,
    writer: Mutex<()>,
}

impl SnapshotManager {
    /// Write an empty index under `root`
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let index_path = root.join(INDEX_FILE);
        if index_path.exists() {
            return Err(Error::InvalidRepository {
                reason: format!("Index already exists at {}", index_path.display()),
            });
        }

        RepositoryIndex::default().save(&index_path)?;
        Self::open(root)
    }

    /// Load the index under `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let index_path = root.join(INDEX_FILE);
        let index = RepositoryIndex::load(&index_path)?;

        Ok(Self {
            index_path,
            lock_path: root.join(LOCK_FILE),
            current: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
        })
    }

    /// Last committed index
    pub fn index(&self) -> Arc<RepositoryIndex> {
        let current = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&current)
    }

    pub fn begin(&self) -> SnapshotBuilder {
        SnapshotBuilder::new(Utc::now())
    }

    /// Atomically publish the builder's tree as a new snapshot.
    ///
    /// On any failure the builder's chunk references are released and the
    /// previously committed index stays in place.
    pub fn commit(&self, builder: SnapshotBuilder, store: &ContentStore) -> Result<SnapshotId> {
        let span = span!(Level::INFO, "commit", files = builder.len());
        let _enter = span.enter();

        let held: Vec<ChunkRef> = builder.chunk_refs().cloned().collect();
        match self.commit_inner(builder, store) {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!("Commit failed, releasing {} chunk references: {}", held.len(), e);
                release_all(store, held.iter());
                Err(e)
            }
        }
    }

    /// Drop an uncommitted builder, releasing every chunk it referenced
    pub fn abandon(&self, builder: SnapshotBuilder, store: &ContentStore) {
        debug!("Abandoning snapshot builder with {} files", builder.len());
        release_all(store, builder.chunk_refs());
    }

    /// All snapshots, newest last
    pub fn list(&self) -> Vec<Snapshot> {
        self.index().snapshots.clone()
    }

    pub fn summaries(&self) -> Vec<SnapshotSummary> {
        self.index().snapshots.iter().map(Snapshot::summary).collect()
    }

    pub fn get(&self, id: SnapshotId) -> Result<Snapshot> {
        self.index()
            .snapshot(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("snapshot {}", id)))
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.index().latest().cloned()
    }

    /// Remove snapshots and their persisted references; ids already gone are
    /// skipped. Chunk files are left for [`SnapshotManager::collect_garbage`].
    pub fn remove(&self, ids: &[SnapshotId], store: &ContentStore) -> Result<Vec<Snapshot>> {
        let _guard = self.lock_writer()?;
        let mut next = RepositoryIndex::load(&self.index_path)?;

        let mut removed = Vec::new();
        for &id in ids {
            match next.remove(id) {
                Some(snapshot) => removed.push(snapshot),
                None => warn!("Snapshot {} already removed", id),
            }
        }

        if removed.is_empty() {
            self.publish(next);
            return Ok(removed);
        }

        next.save(&self.index_path)?;
        self.publish(next);

        for snapshot in &removed {
            release_all(store, snapshot.chunk_refs());
            info!("Removed snapshot {}", snapshot.id);
        }

        Ok(removed)
    }

    /// Delete chunk files no committed snapshot or in-flight builder needs
    pub fn collect_garbage(&self, store: &ContentStore) -> Result<GcReport> {
        let _guard = self.lock_writer()?;
        let index = RepositoryIndex::load(&self.index_path)?;
        let report = store.collect_garbage(&index.chunks)?;
        self.publish(index);

        info!(
            "Garbage collection removed {} chunks ({} bytes)",
            report.chunks_removed, report.bytes_freed
        );
        Ok(report)
    }

    fn commit_inner(&self, builder: SnapshotBuilder, store: &ContentStore) -> Result<SnapshotId> {
        let _guard = self.lock_writer()?;

        let SnapshotBuilder {
            started,
            label,
            files,
        } = builder;
        let mut files: Vec<FileEntry> = files.into_values().collect();

        let mut missing = Vec::new();
        for file in &mut files {
            let mut size = 0;
            for chunk in &file.chunks {
                match store.entry(chunk) {
                    Some(entry) if store.contains(chunk) => size += entry.size,
                    _ => missing.push(chunk.to_string()),
                }
            }
            file.size = size;
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(Error::IncompleteTree { missing });
        }

        let mut next = RepositoryIndex::load(&self.index_path)?;
        let id = SnapshotId(next.next_id);
        let snapshot = Snapshot {
            id,
            created: started,
            label,
            parent: next.latest().map(|s| s.id),
            files,
        };
        let file_count = snapshot.files.len();

        next.append(snapshot, |chunk| store.entry(chunk));
        next.save(&self.index_path)?;
        self.publish(next);

        info!("Committed snapshot {} with {} files", id, file_count);
        Ok(id)
    }

    fn publish(&self, index: RepositoryIndex) {
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        *current = Arc::new(index);
    }

    fn lock_writer(&self) -> Result<WriterGuard<'_>> {
        let local = self.writer.lock().unwrap_or_else(|p| p.into_inner());

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::storage("opening repository lock", e))?;
        file.lock_exclusive()
            .map_err(|e| Error::storage("locking repository", e))?;

        Ok(WriterGuard {
            _local: local,
            _file: file,
        })
    }
}

fn release_all<'a>(store: &ContentStore, chunks: impl Iterator<Item = &'a ChunkRef>) {
    for chunk in chunks {
        if let Err(e) = store.release(chunk) {
            debug!("Release of {} skipped: {}", chunk, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkCodec;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, ContentStore, SnapshotManager)> {
        let temp_dir = TempDir::new()?;
        let manager = SnapshotManager::create(temp_dir.path())?;
        let store = ContentStore::open(temp_dir.path(), ChunkCodec::Plain, &manager.index().chunks)?;
        Ok((temp_dir, store, manager))
    }

    #[test]
    fn test_commit_and_list() -> Result<()> {
        let (_dir, store, manager) = setup()?;

        let mut builder = manager.begin().with_label("first");
        let a = store.put(b"aaaa")?;
        let b = store.put(b"bb")?;
        builder.add_file("docs/z.txt", vec![a.clone(), b.clone()], Some(0o600));
        builder.add_file("docs/a.txt", vec![a.clone()], None);
        let first = manager.commit(builder, &store)?;

        let builder = manager.begin();
        let second = manager.commit(builder, &store)?;

        let snapshots = manager.list();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].id, first);
        assert_eq!(snapshots[1].id, second);
        assert!(second > first);
        assert_eq!(snapshots[1].parent, Some(first));

        let snapshot = manager.get(first)?;
        assert_eq!(snapshot.label.as_deref(), Some("first"));
        assert_eq!(snapshot.files[0].path, PathBuf::from("docs/a.txt"));
        assert_eq!(snapshot.files[1].size, 6);
        assert_eq!(manager.index().chunks[&a].refs, 2);

        Ok(())
    }

    #[test]
    fn test_get_missing_snapshot() -> Result<()> {
        let (_dir, _store, manager) = setup()?;
        assert!(matches!(manager.get(SnapshotId(7)), Err(Error::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_commit_rejects_missing_chunk() -> Result<()> {
        let (dir, store, manager) = setup()?;

        let present = store.put(b"present")?;
        let phantom = ChunkCodec::Plain.chunk_id(b"never stored");
        let mut builder = manager.begin();
        builder.add_file("a", vec![present.clone()], None);
        builder.add_file("b", vec![phantom.clone()], None);

        match manager.commit(builder, &store) {
            Err(Error::IncompleteTree { missing }) => {
                assert_eq!(missing, vec![phantom.to_string()]);
            }
            other => panic!("expected IncompleteTree, got {:?}", other),
        }

        assert!(manager.list().is_empty());
        assert_eq!(store.ref_count(&present), 0);
        assert!(SnapshotManager::open(dir.path())?.list().is_empty());

        Ok(())
    }

    #[test]
    fn test_uncommitted_builder_is_invisible() -> Result<()> {
        let (dir, store, manager) = setup()?;

        let mut builder = manager.begin();
        let chunk = store.put(b"written before the crash")?;
        builder.add_file("file", vec![chunk.clone()], None);
        // Simulated crash: the builder never reaches commit.
        drop(builder);

        assert!(manager.list().is_empty());
        let reopened = SnapshotManager::open(dir.path())?;
        assert!(reopened.list().is_empty());
        assert!(reopened.index().chunks.is_empty());

        // A fresh process sees the chunk file as an orphan.
        let fresh_store =
            ContentStore::open(dir.path(), ChunkCodec::Plain, &reopened.index().chunks)?;
        let report = reopened.collect_garbage(&fresh_store)?;
        assert_eq!(report.chunks_removed, 1);
        assert!(fresh_store.list_stored()?.is_empty());

        Ok(())
    }

    #[test]
    fn test_abandon_releases_references() -> Result<()> {
        let (_dir, store, manager) = setup()?;

        let mut builder = manager.begin();
        let chunk = store.put(b"abandoned")?;
        builder.add_file("file", vec![chunk.clone()], None);
        manager.abandon(builder, &store);

        assert_eq!(store.ref_count(&chunk), 0);
        let report = manager.collect_garbage(&store)?;
        assert_eq!(report.chunks_removed, 1);

        Ok(())
    }

    #[test]
    fn test_remove_then_collect() -> Result<()> {
        let (_dir, store, manager) = setup()?;

        let shared = store.put(b"shared")?;
        let mut builder = manager.begin();
        builder.add_file("a", vec![shared.clone()], None);
        let first = manager.commit(builder, &store)?;

        let only_first = store.put(b"only in first")?;
        let shared_again = store.put(b"shared")?;
        let mut builder = manager.begin();
        builder.add_file("a", vec![shared_again], None);
        let second = manager.commit(builder, &store)?;
        let mut builder = manager.begin();
        builder.add_file("b", vec![only_first.clone()], None);
        let third = manager.commit(builder, &store)?;

        let removed = manager.remove(&[first, third], &store)?;
        assert_eq!(removed.len(), 2);
        assert_eq!(manager.list().iter().map(|s| s.id).collect::<Vec<_>>(), vec![second]);
        assert_eq!(store.ref_count(&shared), 1);
        assert_eq!(store.ref_count(&only_first), 0);

        let report = manager.collect_garbage(&store)?;
        assert_eq!(report.chunks_removed, 1);
        assert_eq!(store.get(&shared)?, b"shared");

        // Removing again is a no-op
        assert!(manager.remove(&[first], &store)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_readers_keep_their_view() -> Result<()> {
        let (_dir, store, manager) = setup()?;

        let before = manager.index();
        let builder = manager.begin();
        manager.commit(builder, &store)?;

        assert!(before.snapshots.is_empty());
        assert_eq!(manager.index().snapshots.len(), 1);

        Ok(())
    }

    #[test]
    fn test_commit_sees_other_writers() -> Result<()> {
        let (dir, store, manager) = setup()?;
        let other = SnapshotManager::open(dir.path())?;

        let first = manager.commit(manager.begin(), &store)?;
        let second = other.commit(other.begin(), &store)?;

        assert_ne!(first, second);
        assert_eq!(other.list().len(), 2);
        assert!(fs::metadata(dir.path().join(LOCK_FILE)).is_ok());

        Ok(())
    }
}
