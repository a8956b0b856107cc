//! Chunking rules for the stop-and-wait transfer protocol.
//!
//! ```text
//! meta ─▶ chunk 0 ─▶ ack 0 ─▶ chunk 1 ─▶ ack 1 ─▶ ... ─▶ chunk N-1 ─▶ ack N-1 ─▶ done
//! ```
//!
//! Chunk `i` of a file of `size` bytes covers `[i * CHUNK_SIZE, min((i + 1) * CHUNK_SIZE, size))`.
//! Only the final chunk may be shorter. A zero-byte file has no chunks.

use std::ops::Range;

/// Chunk size: 64 KiB.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks for a file of `size` bytes.
pub fn total_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Byte range of chunk `index`, or `None` past the end of the file.
pub fn chunk_range(size: u64, index: u64) -> Option<Range<u64>> {
    if index >= total_chunks(size) {
        return None;
    }
    let start = index * CHUNK_SIZE as u64;
    let end = (start + CHUNK_SIZE as u64).min(size);
    Some(start..end)
}

/// Length of chunk `index`, 0 past the end of the file.
pub fn chunk_len(size: u64, index: u64) -> usize {
    chunk_range(size, index).map_or(0, |r| (r.end - r.start) as usize)
}

/// Bytes covered by chunks `0..count`.
pub fn bytes_through(size: u64, count: u64) -> u64 {
    (count * CHUNK_SIZE as u64).min(size)
}

/// Whole-percent progress; an empty file counts as done only once finished.
pub fn percent(done_chunks: u64, total: u64, finished: bool) -> u8 {
    if total == 0 {
        return if finished { 100 } else { 0 };
    }
    ((done_chunks as f64 / total as f64) * 100.0).round().min(100.0) as u8
}
