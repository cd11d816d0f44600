//! Backup runs: expand sources, apply excludes, ingest files, commit a snapshot

use crate::chunk::{fill_block, ChunkRef, ContentStore, DEFAULT_CHUNK_SIZE};
use crate::manifest::{FileEntry, SnapshotId};
use crate::snapshot::SnapshotManager;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use walkdir::WalkDir;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Configuration for backup operations
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Chunk size for file splitting
    pub chunk_size: usize,
    /// Whether to follow symbolic links
    pub follow_symlinks: bool,
    /// Optional label stored on the snapshot
    pub label: Option<String>,
    /// Checked between files; setting it aborts the run without a snapshot
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            follow_symlinks: false,
            label: None,
            cancel: None,
        }
    }
}

/// A file left out of the snapshot and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of a backup run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupReport {
    pub files: usize,
    pub bytes: u64,
    /// Chunk occurrences across all files
    pub chunks: usize,
    /// Chunks whose bytes were written for the first time
    pub new_chunks: usize,
    pub new_bytes: u64,
    pub excluded: usize,
    /// Symlinks that were not followed and special files (fifos, sockets, devices)
    pub not_regular: usize,
    pub skipped: Vec<SkippedFile>,
    /// Snapshot timestamp, taken before the sources are scanned
    pub started: DateTime<Utc>,
    pub duration: Duration,
}

impl BackupReport {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub id: SnapshotId,
    pub report: BackupReport,
}

/// Compiled exclude globs.
///
/// A pattern excludes a path when it matches any run of consecutive path
/// components, so `**/cache/*` and `cache/*` both drop `/srv/app/cache/x`,
/// and `*.tmp` drops every `*.tmp` file or directory at any depth.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let parts: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        for end in 1..=parts.len() {
            for start in 0..end {
                let window = parts[start..end].join("/");
                if self.matches(&window) {
                    return true;
                }
                if start == 0 && path.has_root() && self.matches(&format!("/{}", window)) {
                    return true;
                }
            }
        }

        false
    }

    fn matches(&self, candidate: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(candidate, GLOB_OPTIONS))
    }
}

/// Snapshot path for a source file: the absolute path, lexically normalised,
/// with its root stripped.
pub fn archive_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[derive(Debug, Default)]
struct FileStats {
    chunks: usize,
    new_chunks: usize,
    new_bytes: u64,
}

enum FileOutcome {
    Stored(FileEntry, FileStats),
    Unreadable(io::Error),
    NotAttempted,
}

/// Drives a single backup pass over a [`ContentStore`] and [`SnapshotManager`]
#[derive(Debug, Clone, Default)]
pub struct BackupOrchestrator {
    options: BackupOptions,
}

impl BackupOrchestrator {
    pub fn new(options: BackupOptions) -> Self {
        Self { options }
    }

    /// Back up `paths` minus `excludes` and commit the result as a snapshot.
    ///
    /// Unreadable files are skipped and listed in the report. A store failure
    /// or cancellation abandons the run; no snapshot becomes visible.
    pub fn run<S: AsRef<str>>(
        &self,
        paths: &[S],
        excludes: &[S],
        store: &ContentStore,
        mgr: &SnapshotManager,
    ) -> Result<BackupOutcome> {
        let span = span!(Level::INFO, "backup", sources = paths.len());
        let _enter = span.enter();
        let started = Instant::now();

        if self.options.chunk_size == 0 {
            return Err(Error::Configuration {
                reason: "chunk_size must be greater than 0".to_string(),
            });
        }

        let excludes = ExcludeSet::new(excludes)?;

        let mut builder = mgr.begin();
        if let Some(label) = &self.options.label {
            builder = builder.with_label(label.clone());
        }
        let mut report = BackupReport {
            started: builder.started(),
            ..BackupReport::default()
        };

        let files = self.collect_files(paths, &excludes, &mut report)?;
        info!(
            "Backing up {} files ({} excluded, {} not regular, {} skipped while scanning)",
            files.len(),
            report.excluded,
            report.not_regular,
            report.skipped.len()
        );

        let abort = AtomicBool::new(false);
        let outcomes: Vec<(&PathBuf, Result<FileOutcome>)> = files
            .par_iter()
            .map(|path| {
                if abort.load(Ordering::Relaxed) || self.cancelled() {
                    return (path, Ok(FileOutcome::NotAttempted));
                }
                let outcome = self.ingest_file(path, store);
                if outcome.is_err() {
                    abort.store(true, Ordering::Relaxed);
                }
                (path, outcome)
            })
            .collect();

        let mut fatal = None;
        let mut not_attempted = false;
        for (path, outcome) in outcomes {
            match outcome {
                Ok(FileOutcome::Stored(entry, stats)) => {
                    debug!("Backed up file: {}", path.display());
                    report.files += 1;
                    report.bytes += entry.size;
                    report.chunks += stats.chunks;
                    report.new_chunks += stats.new_chunks;
                    report.new_bytes += stats.new_bytes;
                    if let Some(replaced) = builder.add_entry(entry) {
                        // Two sources normalised to the same archive path.
                        release_partial(store, &replaced.chunks);
                        report.files -= 1;
                        report.bytes -= replaced.size;
                    }
                }
                Ok(FileOutcome::Unreadable(e)) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), e);
                    report.skipped.push(SkippedFile {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
                Ok(FileOutcome::NotAttempted) => not_attempted = true,
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            warn!("Backup aborted: {}", e);
            mgr.abandon(builder, store);
            return Err(e);
        }
        if not_attempted || self.cancelled() {
            info!("Backup cancelled after {} files", report.files);
            mgr.abandon(builder, store);
            return Err(Error::Cancelled);
        }

        let id = mgr.commit(builder, store)?;
        report.duration = started.elapsed();

        info!(
            "Backup completed: snapshot {}, {} files, {} bytes, {} new chunks",
            id, report.files, report.bytes, report.new_chunks
        );
        Ok(BackupOutcome { id, report })
    }

    /// Expand source patterns into the files to ingest, one per archive path,
    /// ordered by archive path
    pub fn collect_files<S: AsRef<str>>(
        &self,
        paths: &[S],
        excludes: &ExcludeSet,
        report: &mut BackupReport,
    ) -> Result<Vec<PathBuf>> {
        let cwd = env::current_dir()?;
        let mut roots = Vec::new();

        for pattern in paths {
            let pattern = pattern.as_ref();
            if is_glob(pattern) {
                let mut matched = 0;
                for entry in glob::glob(pattern)? {
                    match entry {
                        Ok(path) => {
                            matched += 1;
                            roots.push(path);
                        }
                        Err(e) => report.skipped.push(SkippedFile {
                            path: e.path().to_path_buf(),
                            reason: e.error().to_string(),
                        }),
                    }
                }
                if matched == 0 {
                    warn!("Source pattern matched nothing: {}", pattern);
                }
            } else {
                roots.push(PathBuf::from(pattern));
            }
        }

        let mut files = BTreeMap::new();
        for root in roots {
            let root = if root.is_absolute() { root } else { cwd.join(root) };
            self.collect_root(&root, excludes, report, &mut files);
        }

        Ok(files.into_values().collect())
    }

    fn collect_root(
        &self,
        root: &Path,
        excludes: &ExcludeSet,
        report: &mut BackupReport,
        files: &mut BTreeMap<PathBuf, PathBuf>,
    ) {
        let metadata = if self.options.follow_symlinks {
            fs::metadata(root)
        } else {
            fs::symlink_metadata(root)
        };
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping source {}: {}", root.display(), e);
                report.skipped.push(SkippedFile {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        if excludes.is_excluded(root) {
            debug!("Excluding source: {}", root.display());
            report.excluded += 1;
            return;
        }

        if metadata.is_file() {
            add_source_file(files, root.to_path_buf());
            return;
        }
        if !metadata.is_dir() {
            info!("Skipping non-regular source: {}", root.display());
            report.not_regular += 1;
            return;
        }

        let mut excluded = 0;
        let mut not_regular = 0;
        let walker = WalkDir::new(root)
            .follow_links(self.options.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| {
                let keep = entry.depth() == 0 || !excludes.is_excluded(entry.path());
                if !keep {
                    excluded += 1;
                }
                keep
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping entry due to error: {}", e);
                    report.skipped.push(SkippedFile {
                        path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_file() {
                add_source_file(files, entry.into_path());
            } else if !file_type.is_dir() {
                debug!("Skipping non-regular file: {}", entry.path().display());
                not_regular += 1;
            }
        }
        if not_regular > 0 {
            info!("Skipped {} symlinks or special files under {}", not_regular, root.display());
        }
        report.excluded += excluded;
        report.not_regular += not_regular;
    }

    fn ingest_file(&self, path: &Path, store: &ContentStore) -> Result<FileOutcome> {
        // The index stores archive paths as JSON strings.
        if path.to_str().is_none() {
            return Ok(FileOutcome::Unreadable(io::Error::new(
                io::ErrorKind::InvalidData,
                "file name is not valid UTF-8",
            )));
        }

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => return Ok(FileOutcome::Unreadable(e)),
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(e) => return Ok(FileOutcome::Unreadable(e)),
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            Some(metadata.mode())
        };
        #[cfg(not(unix))]
        let mode = None;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        let mut buffer = vec![0u8; self.options.chunk_size];
        let mut chunks: Vec<ChunkRef> = Vec::new();
        let mut stats = FileStats::default();
        let mut size = 0u64;

        loop {
            let read = match fill_block(&mut file, &mut buffer) {
                Ok(read) => read,
                Err(e) => {
                    release_partial(store, &chunks);
                    return Ok(FileOutcome::Unreadable(e));
                }
            };
            if read == 0 {
                break;
            }

            let stored = match store.put_chunk(&buffer[..read]) {
                Ok(stored) => stored,
                Err(e) => {
                    release_partial(store, &chunks);
                    return Err(e);
                }
            };
            stats.chunks += 1;
            if stored.newly_written {
                stats.new_chunks += 1;
                stats.new_bytes += stored.size;
            }
            size += stored.size;
            chunks.push(stored.chunk);

            if read < buffer.len() {
                break;
            }
        }

        let entry = FileEntry {
            path: archive_path(path),
            mode,
            modified,
            chunks,
            size,
        };
        Ok(FileOutcome::Stored(entry, stats))
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }
}

/// Keep the first source seen for each archive path
fn add_source_file(files: &mut BTreeMap<PathBuf, PathBuf>, path: PathBuf) {
    files.entry(archive_path(&path)).or_insert(path);
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn release_partial(store: &ContentStore, chunks: &[ChunkRef]) {
    for chunk in chunks {
        let _ = store.release(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkCodec;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, ContentStore, SnapshotManager)> {
        let temp_dir = TempDir::new()?;
        let repo = temp_dir.path().join("repo");
        fs::create_dir_all(&repo)?;
        let manager = SnapshotManager::create(&repo)?;
        let store = ContentStore::open(&repo, ChunkCodec::Plain, &manager.index().chunks)?;
        Ok((temp_dir, store, manager))
    }

    fn write(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn source_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_exclude_patterns() -> Result<()> {
        let excludes = ExcludeSet::new(&["**/cache/*", "*.tmp", "/srv/secret/*"])?;

        assert!(excludes.is_excluded(Path::new("/home/u/cache/blob")));
        assert!(excludes.is_excluded(Path::new("cache/blob")));
        assert!(excludes.is_excluded(Path::new("/home/u/cache/nested/blob")));
        assert!(excludes.is_excluded(Path::new("/home/u/notes.tmp")));
        assert!(excludes.is_excluded(Path::new("/srv/secret/key")));
        assert!(!excludes.is_excluded(Path::new("/home/u/cached/blob")));
        assert!(!excludes.is_excluded(Path::new("/home/u/notes.txt")));
        assert!(!excludes.is_excluded(Path::new("/home/u/cache")));
        assert!(!ExcludeSet::default().is_excluded(Path::new("/anything")));

        Ok(())
    }

    #[test]
    fn test_archive_path() {
        assert_eq!(
            archive_path(Path::new("/home/u/./docs/../a.txt")),
            PathBuf::from("home/u/a.txt")
        );
        assert_eq!(archive_path(Path::new("rel/b")), PathBuf::from("rel/b"));
    }

    #[test]
    fn test_simple_backup() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("test.txt"), b"Hello, world!\n")?;
        write(&source.join("sub/empty"), b"")?;

        let orchestrator = BackupOrchestrator::new(BackupOptions {
            chunk_size: 4,
            ..BackupOptions::default()
        });
        let outcome = orchestrator.run(&[source_str(&source)], &[], &store, &manager)?;

        let snapshot = manager.get(outcome.id)?;
        assert_eq!(snapshot.files.len(), 2);
        let entry = snapshot
            .find_file(archive_path(&source.join("test.txt")))
            .expect("test.txt in snapshot");
        assert_eq!(entry.size, 14);
        assert_eq!(entry.chunks.len(), 4);
        let empty = snapshot
            .find_file(archive_path(&source.join("sub/empty")))
            .expect("empty file in snapshot");
        assert!(empty.chunks.is_empty());
        assert_eq!(outcome.report.files, 2);
        assert_eq!(outcome.report.bytes, 14);
        assert!(!outcome.report.is_partial());

        Ok(())
    }

    #[test]
    fn test_second_run_deduplicates() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("a"), b"identical content")?;
        write(&source.join("b"), b"identical content")?;

        let orchestrator = BackupOrchestrator::default();
        let first = orchestrator.run(&[source_str(&source)], &[], &store, &manager)?;
        let second = orchestrator.run(&[source_str(&source)], &[], &store, &manager)?;

        assert_eq!(first.report.new_chunks, 1);
        assert_eq!(second.report.new_chunks, 0);
        assert_eq!(store.list_stored()?.len(), 1);
        assert_eq!(manager.get(second.id)?.parent, Some(first.id));

        Ok(())
    }

    #[test]
    fn test_excluded_file_never_committed() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        let cached = source.join("app/cache/blob.bin");
        write(&cached, b"cached")?;
        write(&source.join("app/main.rs"), b"fn main() {}")?;

        let sources = vec![source_str(&source), source_str(&cached)];
        let excludes = vec!["**/cache/*".to_string()];
        let outcome = BackupOrchestrator::default().run(&sources, &excludes, &store, &manager)?;

        let snapshot = manager.get(outcome.id)?;
        assert_eq!(snapshot.files.len(), 1);
        assert!(snapshot.find_file(archive_path(&cached)).is_none());
        assert!(outcome.report.excluded >= 2);

        Ok(())
    }

    #[test]
    fn test_glob_sources() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("one.conf"), b"1")?;
        write(&source.join("two.conf"), b"2")?;
        write(&source.join("three.txt"), b"3")?;

        let pattern = format!("{}/*.conf", source.display());
        let outcome = BackupOrchestrator::default().run(&[pattern], &[], &store, &manager)?;

        assert_eq!(manager.get(outcome.id)?.files.len(), 2);
        Ok(())
    }

    #[test]
    fn test_vanished_file_is_skipped() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        let mut sources = Vec::new();
        for name in ["a", "b", "c", "d"] {
            write(&source.join(name), name.as_bytes())?;
            sources.push(source_str(&source.join(name)));
        }
        let vanished = source.join("e");
        sources.push(source_str(&vanished));

        let outcome = BackupOrchestrator::default().run(&sources, &[], &store, &manager)?;

        assert_eq!(manager.get(outcome.id)?.files.len(), 4);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].path, vanished);
        assert!(outcome.report.is_partial());

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_skipped() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        for name in ["a", "b", "c", "d", "locked"] {
            write(&source.join(name), name.as_bytes())?;
        }
        let locked = source.join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;
        if File::open(&locked).is_ok() {
            // Running with CAP_DAC_OVERRIDE; permissions cannot make it unreadable.
            return Ok(());
        }

        let outcome = BackupOrchestrator::default().run(&[source_str(&source)], &[], &store, &manager)?;

        assert_eq!(manager.get(outcome.id)?.files.len(), 4);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].path, locked);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_file_name_is_skipped() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        for name in ["a", "b", "c", "d"] {
            write(&source.join(name), name.as_bytes())?;
        }
        let bad = source.join(OsStr::from_bytes(b"bad\xff name"));
        if fs::write(&bad, b"bytes").is_err() {
            // The filesystem only accepts UTF-8 names.
            return Ok(());
        }

        let outcome = BackupOrchestrator::default().run(&[source_str(&source)], &[], &store, &manager)?;

        assert_eq!(manager.get(outcome.id)?.files.len(), 4);
        assert_eq!(outcome.report.files, 4);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].path, bad);
        Ok(())
    }

    #[test]
    fn test_aliased_sources_are_ingested_once() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("a"), b"aliased content")?;
        fs::create_dir_all(source.join("sub"))?;

        let sources = vec![
            source_str(&source.join("a")),
            source_str(&source.join("sub").join("..").join("a")),
        ];
        let outcome = BackupOrchestrator::default().run(&sources, &[], &store, &manager)?;

        let snapshot = manager.get(outcome.id)?;
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(outcome.report.files, 1);
        assert_eq!(outcome.report.bytes, 15);

        let chunk = &snapshot.files[0].chunks[0];
        let persisted = manager.index().chunks.get(chunk).map_or(0, |e| e.refs);
        assert_eq!(persisted, 1);
        assert_eq!(store.ref_count(chunk), persisted);
        Ok(())
    }

    #[test]
    fn test_snapshot_time_is_taken_before_scanning() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("a"), b"content")?;

        let before = Utc::now();
        let outcome = BackupOrchestrator::default().run(&[source_str(&source)], &[], &store, &manager)?;

        let snapshot = manager.get(outcome.id)?;
        assert!(outcome.report.started >= before);
        assert_eq!(snapshot.created, outcome.report.started);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_unfollowed_symlinks_are_counted() -> Result<()> {
        use std::os::unix::fs::symlink;

        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        let outside = temp_dir.path().join("outside.txt");
        write(&source.join("a"), b"regular")?;
        write(&outside, b"linked")?;
        symlink(&outside, source.join("link"))?;
        let root_link = temp_dir.path().join("root-link");
        symlink(&outside, &root_link)?;

        let sources = vec![source_str(&source), source_str(&root_link)];
        let outcome = BackupOrchestrator::default().run(&sources, &[], &store, &manager)?;

        let snapshot = manager.get(outcome.id)?;
        assert_eq!(snapshot.files.len(), 1);
        assert!(snapshot.find_file(archive_path(&source.join("link"))).is_none());
        assert_eq!(outcome.report.not_regular, 2);
        assert!(!outcome.report.is_partial());

        let followed = BackupOrchestrator::new(BackupOptions {
            follow_symlinks: true,
            ..BackupOptions::default()
        })
        .run(&sources, &[], &store, &manager)?;
        assert_eq!(manager.get(followed.id)?.files.len(), 3);
        assert_eq!(followed.report.not_regular, 0);
        Ok(())
    }

    #[test]
    fn test_cancelled_run_leaves_no_snapshot() -> Result<()> {
        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("a"), b"content")?;

        let flag = Arc::new(AtomicBool::new(true));
        let orchestrator = BackupOrchestrator::new(BackupOptions {
            cancel: Some(flag),
            ..BackupOptions::default()
        });
        let result = orchestrator.run(&[source_str(&source)], &[], &store, &manager);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(manager.list().is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_storage_failure_aborts_run() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let (temp_dir, store, manager) = setup()?;
        let source = temp_dir.path().join("source");
        write(&source.join("a"), b"new content")?;

        let chunks_dir = temp_dir.path().join("repo").join("chunks");
        fs::set_permissions(&chunks_dir, fs::Permissions::from_mode(0o500))?;
        if fs::create_dir(chunks_dir.join("probe")).is_ok() {
            // Permissions are not enforced for this user.
            fs::set_permissions(&chunks_dir, fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        let result = BackupOrchestrator::default().run(&[source_str(&source)], &[], &store, &manager);
        fs::set_permissions(&chunks_dir, fs::Permissions::from_mode(0o755))?;

        assert!(matches!(result, Err(Error::StorageUnavailable { .. })));
        assert!(manager.list().is_empty());
        Ok(())
    }
}
