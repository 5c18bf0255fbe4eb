//! Defines the [`SegregatedIndex`] and the size-class function behind it.
//!
//! The index is an array of [`CLASS_COUNT`] bucket heads stored at the very start of
//! the heap. Each bucket is the head of an explicit, doubly linked, non-circular list
//! threaded through the payloads of free blocks. Heads and links are byte offsets from
//! the heap base; the index itself occupies offset `0`, so `0` doubles as "none".

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::block::{Block, Links, MIN_BLOCK_SIZE};
use crate::header::{ALIGNMENT, WORD_SIZE};

/// Number of size classes.
pub const CLASS_COUNT: usize = 17;

/// Bytes occupied by the bucket array at the start of the heap.
pub const INDEX_SIZE: usize = CLASS_COUNT * WORD_SIZE;

// Prologue (2 words) + epilogue (1 word) must bring the first payload back to alignment.
const_assert!((INDEX_SIZE + 3 * WORD_SIZE) % ALIGNMENT == 0);

/// Maps a block size to its bucket.
///
/// Bucket `c` holds blocks whose size lies in `(16 << (c - 1), 16 << c]`; bucket `0`
/// holds minimum-sized blocks and the last bucket everything above its lower bound.
#[inline]
pub fn size_class(size: usize) -> usize {
    let units = size.div_ceil(MIN_BLOCK_SIZE).max(1);
    match units.checked_next_power_of_two() {
        Some(p) => (p.trailing_zeros() as usize).min(CLASS_COUNT - 1),
        None => CLASS_COUNT - 1,
    }
}

/// The segregated free-list index of one heap.
#[derive(Debug)]
pub struct SegregatedIndex {
    base: NonNull<u8>,
}

impl SegregatedIndex {
    /// Creates an index whose bucket array lives at `base` and empties every bucket.
    ///
    /// # Safety
    /// `base` must be valid for writes of [`INDEX_SIZE`] bytes, word-aligned, and stay
    /// owned by this index for as long as it is used.
    pub unsafe fn init(base: NonNull<u8>) -> Self {
        unsafe { base.as_ptr().write_bytes(0, INDEX_SIZE) };
        SegregatedIndex { base }
    }

    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline(always)]
    fn offset_of(&self, block: Block) -> u32 {
        debug_assert!(block.addr() > self.base.as_ptr() as usize);
        (block.addr() - self.base.as_ptr() as usize) as u32
    }

    #[inline(always)]
    unsafe fn block_at(&self, offset: u32) -> Option<Block> {
        match offset {
            0 => None,
            off => Some(Block::from_payload(unsafe {
                NonNull::new_unchecked(self.base.as_ptr().add(off as usize))
            })),
        }
    }

    #[inline(always)]
    unsafe fn bucket(&self, class: usize) -> *mut u32 {
        debug_assert!(class < CLASS_COUNT);
        unsafe { self.base.as_ptr().cast::<u32>().add(class) }
    }

    /// Returns the first block of bucket `class`.
    ///
    /// # Safety
    /// The index must be consistent.
    #[inline]
    pub unsafe fn head(&self, class: usize) -> Option<Block> {
        unsafe { self.block_at(self.bucket(class).read()) }
    }

    /// Returns the block after `block` in its bucket.
    ///
    /// # Safety
    /// `block` must currently be in the index.
    #[inline]
    pub unsafe fn next_of(&self, block: Block) -> Option<Block> {
        unsafe { self.block_at(block.links().next) }
    }

    /// Returns the block before `block` in its bucket.
    ///
    /// # Safety
    /// `block` must currently be in the index.
    #[inline]
    pub unsafe fn prev_of(&self, block: Block) -> Option<Block> {
        unsafe { self.block_at(block.links().prev) }
    }

    /// Pushes a free block to the front of the bucket matching its size.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `block` must be a free block of the heap this index belongs to, with final tags
    /// written, and must not already be in the index.
    pub unsafe fn insert(&mut self, block: Block) {
        unsafe {
            debug_assert!(!block.is_allocated(), "Only free blocks can be indexed.");
            let bucket = self.bucket(size_class(block.size()));
            let offset = self.offset_of(block);
            let head = bucket.read();

            block.set_links(Links { prev: 0, next: head });
            if let Some(old_head) = self.block_at(head) {
                old_head.set_prev(offset);
            }
            bucket.write(offset);
        }
    }

    /// Unlinks `block` from its bucket and clears its links.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `block` must be in the index, and its header must still hold the size it had
    /// when it was inserted.
    pub unsafe fn remove(&mut self, block: Block) {
        unsafe {
            debug_assert!(
                !block.is_allocated(),
                "Allocated blocks are never in the index."
            );
            let Links { prev, next } = block.links();

            match self.block_at(prev) {
                Some(prev) => prev.set_next(next),
                None => {
                    let bucket = self.bucket(size_class(block.size()));
                    debug_assert_eq!(
                        bucket.read(),
                        self.offset_of(block),
                        "A block without predecessor should head its bucket."
                    );
                    bucket.write(next);
                }
            }
            if let Some(next) = self.block_at(next) {
                next.set_prev(prev);
            }
            block.clear_links();
        }
    }

    /// Returns the first block of at least `size` bytes, scanning the bucket of `size`
    /// and then every larger bucket, each from its head.
    ///
    /// # Safety
    /// The index must be consistent.
    pub unsafe fn find_fit(&self, size: usize) -> Option<Block> {
        (size_class(size)..CLASS_COUNT)
            .flat_map(|class| unsafe { self.iter(class) })
            .find(|block| unsafe { block.size() } >= size)
    }

    /// Iterates over the blocks of bucket `class` from head to tail.
    ///
    /// # Safety
    /// The index must stay consistent and unmodified while the iterator is alive.
    pub unsafe fn iter(&self, class: usize) -> Bucket<'_> {
        Bucket {
            index: self,
            cursor: unsafe { self.head(class) },
        }
    }
}

/// Iterator over the blocks of one bucket.
pub struct Bucket<'a> {
    index: &'a SegregatedIndex,
    cursor: Option<Block>,
}

impl Iterator for Bucket<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.cursor?;
        self.cursor = unsafe { self.index.next_of(block) };
        Some(block)
    }
}
