use crate::types::{ByteRange, ChunkInfo};

/// Number of chunks needed to cover `file_size` bytes.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    assert!(chunk_size > 0, "chunk size must be greater than zero");
    file_size.div_ceil(chunk_size)
}

/// Splits `[0, file_size)` into consecutive chunks of `chunk_size` bytes.
///
/// The last chunk may be shorter. An empty file yields an empty plan.
///
/// # Panics
///
/// Panics if `chunk_size` is zero or the plan would need more than
/// `u32::MAX` chunks. Callers validate both before planning.
pub fn plan(file_size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
    let count = chunk_count(file_size, chunk_size);
    assert!(count <= u64::from(u32::MAX), "too many chunks");

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = start.saturating_add(chunk_size).min(file_size);
            ChunkInfo::new(i as u32, ByteRange::new(start, end))
        })
        .collect()
}
