//! Chunk canaries: a pointer-sized verification word at the tail of every
//! small allocation whose class leaves room for it. The value is derived
//! from a per-process secret and the canary's own address, so a leaked
//! canary from one chunk predicts nothing about its neighbours.

use crate::options;
use crate::util::{hash_chunk, CANARY_MASK};

/// Canary value for a canary stored at `addr`.
#[inline]
pub fn value(addr: usize) -> usize {
    (options::get().chunk_canary_secret ^ hash_chunk(addr)) & CANARY_MASK
}

/// Write the canary for a chunk of `class_size` bytes starting at `chunk`.
///
/// # Safety
/// The chunk must be writable for `class_size` bytes and `canary_len` must
/// not exceed `class_size`.
#[inline]
pub unsafe fn write(chunk: *mut u8, class_size: usize, canary_len: usize) {
    let addr = chunk.add(class_size - canary_len);
    (addr as *mut usize).write_unaligned(value(addr as usize));
}

/// Check the canary of a chunk of `class_size` bytes starting at `chunk`.
///
/// # Safety
/// Same layout requirements as [`write`].
#[inline]
pub unsafe fn check(chunk: *mut u8, class_size: usize, canary_len: usize) -> bool {
    let addr = chunk.add(class_size - canary_len);
    (addr as *const usize).read_unaligned() == value(addr as usize)
}
