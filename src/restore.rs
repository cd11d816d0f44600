//! Restore functionality for reconstructing files from snapshots

use crate::backup::SkippedFile;
use crate::chunk::ContentStore;
use crate::manifest::{FileEntry, SnapshotId};
use crate::snapshot::SnapshotManager;
use crate::{Error, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};

const FILTER_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Result of a restore operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Number of files successfully restored
    pub files_restored: usize,
    /// Total bytes written
    pub bytes_written: u64,
    /// Files that could not be restored
    pub skipped: Vec<SkippedFile>,
    pub duration: Duration,
}

impl RestoreReport {
    /// Whether any file was left out
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Convert a partial restore into [`Error::PartialFailure`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_partial() {
            return Err(Error::PartialFailure {
                skipped: self.skipped.into_iter().map(|s| s.path).collect(),
            });
        }
        Ok(self)
    }
}

/// Restore engine for reconstructing files from snapshots
pub struct RestoreEngine<'a> {
    store: &'a ContentStore,
    manager: &'a SnapshotManager,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(store: &'a ContentStore, manager: &'a SnapshotManager) -> Self {
        Self { store, manager }
    }

    /// Restore every file of a snapshot under `target`
    pub fn restore<P: AsRef<Path>>(&self, id: SnapshotId, target: P) -> Result<RestoreReport> {
        self.restore_filtered::<_, &str>(id, target, &[])
    }

    /// Restore the files whose archive path, or one of its parent
    /// directories, matches an `include` glob. An empty list restores all.
    pub fn restore_filtered<P: AsRef<Path>, S: AsRef<str>>(
        &self,
        id: SnapshotId,
        target: P,
        include: &[S],
    ) -> Result<RestoreReport> {
        let target = target.as_ref();
        let span = span!(Level::INFO, "restore", snapshot = %id, target = %target.display());
        let _enter = span.enter();
        let started = Instant::now();

        let include = include
            .iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let snapshot = self.manager.get(id)?;

        fs::create_dir_all(target).map_err(|e| Error::storage("creating restore target", e))?;
        info!("Restoring {} files from snapshot {}", snapshot.files.len(), id);

        let mut report = RestoreReport::default();
        for entry in &snapshot.files {
            if !include.is_empty() && !is_included(&entry.path, &include) {
                continue;
            }

            let Some(relative) = safe_relative(&entry.path) else {
                warn!("Refusing unsafe archive path: {}", entry.path.display());
                report.skipped.push(SkippedFile {
                    path: entry.path.clone(),
                    reason: "archive path escapes the restore target".to_string(),
                });
                continue;
            };

            let destination = target.join(relative);
            match self.restore_file(entry, &destination) {
                Ok(bytes) => {
                    debug!("Restored file: {} ({} bytes)", destination.display(), bytes);
                    report.files_restored += 1;
                    report.bytes_written += bytes;
                }
                Err(e) => {
                    warn!("Cannot restore {}: {}", entry.path.display(), e);
                    report.skipped.push(SkippedFile {
                        path: entry.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.duration = started.elapsed();
        info!(
            "Restore completed: {} files restored, {} skipped, {} bytes in {:?}",
            report.files_restored,
            report.skipped.len(),
            report.bytes_written,
            report.duration
        );
        Ok(report)
    }

    /// Write one file; on failure the partial output is removed
    fn restore_file(&self, entry: &FileEntry, destination: &Path) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let result = self.write_chunks(entry, destination);
        if result.is_err() {
            let _ = fs::remove_file(destination);
        }
        result
    }

    fn write_chunks(&self, entry: &FileEntry, destination: &Path) -> Result<u64> {
        let mut writer = BufWriter::new(File::create(destination)?);
        let mut written = 0u64;
        for chunk in &entry.chunks {
            let data = self.store.get(chunk)?;
            writer.write_all(&data)?;
            written += data.len() as u64;
        }
        writer.flush()?;
        drop(writer);

        if written != entry.size {
            return Err(Error::Integrity {
                reason: format!(
                    "Restored {} bytes for {}, expected {}",
                    written,
                    entry.path.display(),
                    entry.size
                ),
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.mode {
                fs::set_permissions(destination, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }

        Ok(written)
    }
}

/// The archive path if it stays beneath the restore target
fn safe_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn is_included(path: &Path, include: &[Pattern]) -> bool {
    path.ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .any(|p| include.iter().any(|pattern| pattern.matches_path_with(p, FILTER_OPTIONS)))
}
