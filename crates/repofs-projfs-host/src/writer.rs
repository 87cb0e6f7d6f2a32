// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Chunked, aligned file-data delivery
//!
//! Blob contents are written back to the OS in bounded chunks whose offsets
//! respect the storage device's write alignment. Small files go out in one
//! write; large requests are split at aligned boundaries.

use bytes::Bytes;

use crate::os::{ErrorCode, Guid, OsResult, ProjectionOs};

/// Files no larger than this are always delivered in a single write.
pub const MIN_CHUNK: u64 = 512 * 1024;

/// Upper bound on the size of any single write.
pub const MAX_CHUNK: u64 = 5 * 1024 * 1024;

/// Round `value` down to a multiple of `alignment` (a power of two).
pub fn block_align_truncate(value: u64, alignment: u32) -> u64 {
    value & !(u64::from(alignment) - 1)
}

/// Deliver `length` bytes of `contents` starting at `start_offset`, writing
/// at most `chunk_size` bytes at a time through one aligned buffer.
///
/// Every write lands at `start_offset + k * chunk_size`. A failed write is
/// returned verbatim; a failed buffer allocation is out-of-memory.
pub fn write_file_chunks(
    os: &dyn ProjectionOs,
    data_stream_id: &Guid,
    contents: &Bytes,
    start_offset: u64,
    length: u64,
    chunk_size: u64,
) -> OsResult<()> {
    let mut buffer = os
        .allocate_aligned_buffer(chunk_size as usize)
        .ok_or(ErrorCode::OUT_OF_MEMORY)?;

    let mut offset = start_offset;
    let mut remaining = length;
    while remaining > 0 {
        let copy_size = u64::min(remaining, chunk_size) as usize;
        let start = offset as usize;
        buffer.as_mut_slice()[..copy_size].copy_from_slice(&contents[start..start + copy_size]);
        os.write_file_data(data_stream_id, &buffer.as_slice()[..copy_size], offset)?;
        remaining -= copy_size as u64;
        offset += copy_size as u64;
    }

    Ok(())
}

/// Single-write delivery: the whole range in one chunk.
pub fn write_single_chunk(
    os: &dyn ProjectionOs,
    data_stream_id: &Guid,
    contents: &Bytes,
    start_offset: u64,
    length: u64,
) -> OsResult<()> {
    write_file_chunks(os, data_stream_id, contents, start_offset, length, length)
}
