//! Utility functions specific to the [`RawMalloc`](super::RawMalloc) allocator.

use crate::block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TAGS_SIZE};
use crate::header::ALIGNMENT;

/// Returns the smallest integer `z` such that `z ≥ x` and `z = y.k` for some integer `k`.
/// or `None` if that integer can not be contained in a `usize`.
///
/// # Panics
/// Panics if `y` is 0.
#[inline]
pub fn find_divisible(x: usize, y: usize) -> Option<usize> {
    if x % y == 0 {
        Some(x)
    } else {
        ((x / y) * y).checked_add(y)
    }
}

/// Turns a payload request of `size` bytes into a block size: header and footer
/// added, rounded up to [`ALIGNMENT`], at least [`MIN_BLOCK_SIZE`].
/// Returns `None` if no block can be that large.
#[inline]
pub fn adjust_size(size: usize) -> Option<usize> {
    if size <= ALIGNMENT {
        return Some(MIN_BLOCK_SIZE);
    }
    find_divisible(size.checked_add(TAGS_SIZE)?, ALIGNMENT).filter(|&size| size <= MAX_BLOCK_SIZE)
}
