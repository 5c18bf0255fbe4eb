//! Allocator configuration.

use crate::block::MIN_BLOCK_SIZE;
use crate::header::ALIGNMENT;

/// Default number of bytes the heap grows by when no free block fits.
pub const CHUNK_SIZE: usize = 1 << 12;

/// Tunables of a [`RawMalloc`](crate::RawMalloc).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Sets the minimum heap extension, also used for the initial extension.
    /// The value is rounded up to a whole number of minimum-sized blocks.
    pub const fn chunk_size(mut self, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size < MIN_BLOCK_SIZE {
            MIN_BLOCK_SIZE
        } else {
            chunk_size
        };
        self.chunk_size = chunk_size.next_multiple_of(ALIGNMENT);
        self
    }

    #[inline]
    pub const fn get_chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
