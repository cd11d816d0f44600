//! Content-addressed chunk storage with reference-counted deduplication

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[cfg(feature = "encryption")]
use crate::crypto::MasterKey;
#[cfg(feature = "encryption")]
use std::sync::Arc;

/// Default chunk size for file splitting (1MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

const TMP_PREFIX: &str = ".tmp-";

/// A content-addressed chunk identified by its BLAKE3 hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkRef(String);

impl ChunkRef {
    fn from_hash(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }

    /// Parse a hex chunk reference, rejecting anything that is not 32 bytes of hex
    pub fn parse(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        if bytes.len() == blake3::OUT_LEN {
            Some(Self(hex_str.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Get the hash as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChunkRef {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid chunk reference: {:?}", value))
    }
}

impl From<ChunkRef> for String {
    fn from(chunk: ChunkRef) -> Self {
        chunk.0
    }
}

impl std::fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Size and reference count of a stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Plaintext size
    pub size: u64,
    /// Size on disk, including nonce and tag when sealed
    pub stored_size: u64,
    /// Number of snapshot file entries referencing the chunk
    pub refs: u64,
}

/// How chunk bytes are named and laid out on disk
#[derive(Debug, Clone)]
pub enum ChunkCodec {
    /// Plain BLAKE3 names, plaintext on disk
    Plain,
    /// Keyed BLAKE3 names, ChaCha20-Poly1305 sealed on disk
    #[cfg(feature = "encryption")]
    Sealed(Arc<MasterKey>),
}

impl ChunkCodec {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, ChunkCodec::Plain)
    }

    pub fn chunk_id(&self, data: &[u8]) -> ChunkRef {
        match self {
            ChunkCodec::Plain => ChunkRef::from_hash(blake3::hash(data)),
            #[cfg(feature = "encryption")]
            ChunkCodec::Sealed(key) => ChunkRef::from_hash(key.chunk_id(data)),
        }
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ChunkCodec::Plain => Ok(data.to_vec()),
            #[cfg(feature = "encryption")]
            ChunkCodec::Sealed(key) => key.seal(data),
        }
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            ChunkCodec::Plain => Ok(stored),
            #[cfg(feature = "encryption")]
            ChunkCodec::Sealed(key) => key.open(&stored),
        }
    }
}

/// Result of a single `put`
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk: ChunkRef,
    pub size: u64,
    /// False when the content was already present and only its count moved
    pub newly_written: bool,
}

/// Outcome of a garbage collection pass
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GcReport {
    pub chunks_removed: usize,
    pub bytes_freed: u64,
    pub temp_files_removed: usize,
}

/// Chunk files on disk plus the live reference-count table.
///
/// Counts in the table include references held by in-flight snapshot
/// builders. The persisted counts live in the repository index and only move
/// on commit and prune.
#[derive(Debug)]
pub struct ContentStore {
    chunks_path: PathBuf,
    codec: ChunkCodec,
    table: Mutex<HashMap<ChunkRef, ChunkEntry>>,
    tmp_seq: AtomicU64,
}

impl ContentStore {
    /// Open the chunk store under `root`, seeding counts from a persisted table
    pub fn open<P: AsRef<Path>>(
        root: P,
        codec: ChunkCodec,
        persisted: &BTreeMap<ChunkRef, ChunkEntry>,
    ) -> Result<Self> {
        let chunks_path = root.as_ref().join("chunks");
        fs::create_dir_all(&chunks_path)
            .map_err(|e| Error::storage("creating chunk directory", e))?;

        let table = persisted
            .iter()
            .map(|(chunk, entry)| (chunk.clone(), *entry))
            .collect();

        Ok(Self {
            chunks_path,
            codec,
            table: Mutex::new(table),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    /// Store bytes and take one reference on the resulting chunk
    pub fn put(&self, data: &[u8]) -> Result<ChunkRef> {
        self.put_chunk(data).map(|stored| stored.chunk)
    }

    /// Like [`ContentStore::put`] but also reports whether bytes hit the disk
    pub fn put_chunk(&self, data: &[u8]) -> Result<StoredChunk> {
        let chunk = self.codec.chunk_id(data);
        let size = data.len() as u64;

        // Another handle may have collected the file since this table was
        // seeded, so a known chunk still needs its file on disk.
        let known = self.table().contains_key(&chunk);
        if known && self.chunk_path(&chunk).is_file() {
            if let Some(entry) = self.table().get_mut(&chunk) {
                entry.refs += 1;
                return Ok(StoredChunk {
                    chunk,
                    size,
                    newly_written: false,
                });
            }
        }

        // Concurrent writers of the same content race harmlessly: each writes
        // its own temp file and the rename is idempotent.
        let (stored_size, wrote_file) = self.write_chunk_file(&chunk, data)?;

        let mut table = self.table();
        let newly_written = wrote_file && (known || !table.contains_key(&chunk));
        let entry = table.entry(chunk.clone()).or_insert(ChunkEntry {
            size,
            stored_size,
            refs: 0,
        });
        entry.refs += 1;

        Ok(StoredChunk {
            chunk,
            size,
            newly_written,
        })
    }

    /// Retrieve a referenced chunk, verifying authenticity and content hash
    pub fn get(&self, chunk: &ChunkRef) -> Result<Vec<u8>> {
        let referenced = self.table().get(chunk).map_or(false, |e| e.refs > 0);
        if !referenced {
            return Err(Error::not_found(format!("chunk {}", chunk)));
        }
        self.read_verified(chunk)
    }

    /// Drop one reference; the file stays until garbage collection
    pub fn release(&self, chunk: &ChunkRef) -> Result<()> {
        match self.table().get_mut(chunk) {
            Some(entry) if entry.refs > 0 => {
                entry.refs -= 1;
                Ok(())
            }
            _ => Err(Error::not_found(format!("chunk {}", chunk))),
        }
    }

    /// Whether the chunk is known to the table and present on disk
    pub fn contains(&self, chunk: &ChunkRef) -> bool {
        self.table().contains_key(chunk) && self.chunk_path(chunk).is_file()
    }

    pub fn ref_count(&self, chunk: &ChunkRef) -> u64 {
        self.table().get(chunk).map_or(0, |e| e.refs)
    }

    pub fn entry(&self, chunk: &ChunkRef) -> Option<ChunkEntry> {
        self.table().get(chunk).copied()
    }

    /// Read a chunk regardless of its reference count and check it
    pub fn verify(&self, chunk: &ChunkRef) -> Result<()> {
        self.read_verified(chunk).map(|_| ())
    }

    /// List every chunk file present on disk
    pub fn list_stored(&self) -> Result<Vec<ChunkRef>> {
        let mut chunks = Vec::new();
        self.scan_chunks_dir(&self.chunks_path, &mut chunks, &mut Vec::new())?;
        Ok(chunks)
    }

    /// Delete chunk files that neither the persisted index nor an in-flight
    /// builder references, plus stale temp files from interrupted writes.
    pub fn collect_garbage(&self, persisted: &BTreeMap<ChunkRef, ChunkEntry>) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut stored = Vec::new();
        let mut temp_files = Vec::new();
        self.scan_chunks_dir(&self.chunks_path, &mut stored, &mut temp_files)?;

        let mut table = self.table();
        for chunk in stored {
            let live = persisted.get(&chunk).map_or(false, |e| e.refs > 0)
                || table.get(&chunk).map_or(false, |e| e.refs > 0);
            if live {
                continue;
            }

            let path = self.chunk_path(&chunk);
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(|e| Error::storage("removing chunk", e))?;
            table.remove(&chunk);
            report.chunks_removed += 1;
            report.bytes_freed += len;
            debug!("Removed unreferenced chunk {}", chunk);
        }
        drop(table);

        for path in temp_files {
            match fs::remove_file(&path) {
                Ok(()) => report.temp_files_removed += 1,
                Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }

        Ok(report)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ChunkRef, ChunkEntry>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_verified(&self, chunk: &ChunkRef) -> Result<Vec<u8>> {
        let path = self.chunk_path(chunk);
        let stored = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("chunk {}", chunk)));
            }
            Err(e) => return Err(Error::storage("reading chunk", e)),
        };

        let data = self.codec.decode(stored)?;
        let computed = self.codec.chunk_id(&data);
        if computed != *chunk {
            return Err(Error::Integrity {
                reason: format!("Chunk hash mismatch: expected {}, got {}", chunk, computed),
            });
        }

        Ok(data)
    }

    /// Returns the stored size and whether a new file was created
    fn write_chunk_file(&self, chunk: &ChunkRef, data: &[u8]) -> Result<(u64, bool)> {
        let chunk_path = self.chunk_path(chunk);

        // A complete file under the final name is always valid: it only ever
        // appears through rename.
        if let Ok(metadata) = fs::metadata(&chunk_path) {
            return Ok((metadata.len(), false));
        }

        let parent = chunk_path
            .parent()
            .unwrap_or(self.chunks_path.as_path())
            .to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| Error::storage("creating chunk directory", e))?;

        let encoded = self.codec.encode(data)?;
        let tmp_path = parent.join(format!(
            "{}{}-{}-{}",
            TMP_PREFIX,
            &chunk.as_str()[2..],
            process::id(),
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        ));

        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &chunk_path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::storage("writing chunk", e));
        }

        Ok((encoded.len() as u64, true))
    }

    /// Get the file path for a chunk reference
    fn chunk_path(&self, chunk: &ChunkRef) -> PathBuf {
        let hash_str = chunk.as_str();
        // First 2 characters select the fan-out directory
        self.chunks_path.join(&hash_str[..2]).join(&hash_str[2..])
    }

    fn scan_chunks_dir(
        &self,
        dir: &Path,
        chunks: &mut Vec<ChunkRef>,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| Error::storage("listing chunks", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage("listing chunks", e))?;
            let path = entry.path();

            if path.is_dir() {
                self.scan_chunks_dir(&path, chunks, temp_files)?;
                continue;
            }

            let (Some(dir_name), Some(file_name)) = (
                path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()),
                path.file_name().and_then(|n| n.to_str()),
            ) else {
                continue;
            };

            if file_name.starts_with(TMP_PREFIX) {
                temp_files.push(path.clone());
            } else if let Some(chunk) = ChunkRef::parse(&format!("{}{}", dir_name, file_name)) {
                chunks.push(chunk);
            } else {
                warn!("Ignoring unexpected file in chunk store: {}", path.display());
            }
        }
        Ok(())
    }
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of input
pub(crate) fn fill_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
