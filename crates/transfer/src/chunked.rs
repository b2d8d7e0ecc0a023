use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::types::ByteRange;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Random-access view of the bytes being uploaded.
///
/// Implementations are read-only; concurrent reads of different ranges
/// must not interfere with each other.
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly the bytes of `range`.
    fn read_range(&self, range: &ByteRange) -> Result<Vec<u8>, TransferError>;
}

fn check_bounds(range: &ByteRange, len: u64) -> Result<(), TransferError> {
    if range.start > range.end || range.end > len {
        return Err(TransferError::RangeOutOfBounds {
            start: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Re-slices chunks from an open file handle.
pub struct FileSource {
    file: Mutex<std::fs::File>,
    len: u64,
    path: PathBuf,
}

impl FileSource {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, range: &ByteRange) -> Result<Vec<u8>, TransferError> {
        check_bounds(range, self.len)?;

        let mut buf = vec![0u8; range.len() as usize];
        // Seek and read must happen under the same lock.
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(range.start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Serves chunks from bytes already held in memory.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, range: &ByteRange) -> Result<Vec<u8>, TransferError> {
        check_bounds(range, self.len())?;
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}
