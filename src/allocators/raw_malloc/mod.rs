//! A singlethreaded segregated-fit memory allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Block sizes
// Every request is turned into a block size before anything else happens: payload plus
// header and footer, rounded up to `ALIGNMENT` and never below `MIN_BLOCK_SIZE`
// (see [`util::adjust_size`]). The private functions below only ever see adjusted sizes.
//
// ## Heap shape
// `Heap::epilogue` always names the position right after the last block; its header is
// the zero-sized epilogue tag. Growing the heap turns that position into the payload of
// a new free block and writes a fresh epilogue after it.

use self::util::adjust_size;
use crate::block::{Block, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TAGS_SIZE};
use crate::config::Config;
use crate::error::{
    AlreadyInitializedSnafu, CorruptTagsSnafu, ForeignPointerSnafu, HeapLimitSnafu, MallocError,
    MisalignedRegionSnafu, NonContiguousSnafu, NotAllocatedSnafu, OutOfMemorySnafu,
    ShortGrowthSnafu, TooLargeSnafu, UninitializedSnafu,
};
use crate::freelist::{SegregatedIndex, INDEX_SIZE};
use crate::growers::Grower;
use crate::header::{Header, ALIGNMENT, WORD_SIZE};
use crate::util::raw_ptr;

use core::fmt::Debug;
use core::ptr::{copy_nonoverlapping, null_mut, NonNull};

use snafu::{ensure, OptionExt, ResultExt};
use static_assertions::const_assert;
use tracing::{debug, error, instrument, warn, Level};

mod check;
mod util;

pub use self::check::HeapStats;

/// Bytes requested by [`RawMalloc::init`]: the index, the prologue and the epilogue.
const BOOTSTRAP_SIZE: usize = INDEX_SIZE + PROLOGUE_SIZE + WORD_SIZE;

/// The prologue is a header and a footer with nothing in between.
const PROLOGUE_SIZE: usize = 2 * WORD_SIZE;

const_assert!(BOOTSTRAP_SIZE % ALIGNMENT == 0);

/// A single threaded memory allocator.
pub struct RawMalloc<T: Grower> {
    grower: T,
    config: Config,
    heap: Option<Heap>,
}

/// The managed region, available once the allocator is initialized.
#[derive(Debug)]
struct Heap {
    index: SegregatedIndex,
    epilogue: Block,
    end: NonNull<u8>,
}

impl<T: Grower> Debug for RawMalloc<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawMalloc")
            .field("config", &self.config)
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

impl<T: Grower> RawMalloc<T> {
    /// Creates an allocator instance with the specified grower.
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying buffer for the lifetime of the returned allocator.
    pub const unsafe fn with_grower(grower: T) -> Self {
        RawMalloc::with_config(grower, Config::new())
    }

    /// Same as [`with_grower`](RawMalloc::with_grower) with an explicit configuration.
    ///
    /// # Safety
    /// See [`with_grower`](RawMalloc::with_grower).
    pub const unsafe fn with_config(grower: T, config: Config) -> Self {
        RawMalloc {
            grower,
            config,
            heap: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.heap.is_some()
    }

    /// Number of bytes obtained from the grower so far, index and sentinels included.
    pub fn heap_len(&self) -> usize {
        self.heap.as_ref().map_or(0, Heap::len)
    }

    /// Lays out the initial heap: the bucket array, the prologue and the epilogue,
    /// followed by one free block of the configured chunk size.
    ///
    /// Must run once before any other operation. An error is fatal for the allocator:
    /// if the initial extension fails the sentinels stay in place and later
    /// allocations simply keep trying to grow.
    #[instrument(level = "info", skip(self), err(Debug, level = Level::ERROR))]
    pub fn init(&mut self) -> Result<(), MallocError> {
        ensure!(self.heap.is_none(), AlreadyInitializedSnafu);

        let (base, granted) = unsafe { self.grower.grow(BOOTSTRAP_SIZE) }
            .context(OutOfMemorySnafu { size: BOOTSTRAP_SIZE })?;
        ensure!(
            granted >= BOOTSTRAP_SIZE,
            ShortGrowthSnafu {
                requested: BOOTSTRAP_SIZE,
                granted
            }
        );
        let addr = base.as_ptr() as usize;
        ensure!(addr % ALIGNMENT == 0, MisalignedRegionSnafu { addr });

        let heap = unsafe {
            let index = SegregatedIndex::init(base);
            let prologue = Block::from_payload(NonNull::new_unchecked(
                base.as_ptr().add(INDEX_SIZE + WORD_SIZE),
            ));
            prologue.write_tags(PROLOGUE_SIZE, true);
            let epilogue = prologue.next();
            epilogue.write_header(Header::EPILOGUE);
            Heap {
                index,
                epilogue,
                end: NonNull::new_unchecked(base.as_ptr().add(granted)),
            }
        };
        debug!(?heap, "Laid out index and sentinels.");
        self.heap = Some(heap);

        self.extend_heap(self.config.get_chunk_size())?;
        Ok(())
    }

    /// Allocates a block with at least `size` bytes of payload.
    /// Returns null if `size` is zero or the request cannot be satisfied.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        match self.try_malloc(size) {
            Ok(p) => raw_ptr(p),
            Err(err) => {
                error!(%err, size, "Allocation failed.");
                null_mut()
            }
        }
    }

    /// Allocates a block with at least `size` bytes of payload, aligned to [`ALIGNMENT`].
    /// Returns `Ok(None)` for a zero-sized request.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::DEBUG))]
    pub fn try_malloc(&mut self, size: usize) -> Result<Option<NonNull<u8>>, MallocError> {
        if size == 0 {
            debug!("Zero-sized request, nothing to allocate.");
            return Ok(None);
        }
        let block_size = adjust_size(size).context(TooLargeSnafu { size })?;
        debug!(block_size, "Size adjusted.");
        Ok(Some(self.allocate(block_size)?.payload()))
    }

    /// Releases the block behind `ptr`. A null `ptr` is ignored, and so is (with a
    /// logged warning) a pointer that [`try_free`](RawMalloc::try_free) rejects.
    ///
    /// # Safety
    /// See [`try_free`](RawMalloc::try_free).
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(err) = unsafe { self.try_free(ptr) } {
            warn!(%err, ?ptr, "Ignoring invalid free.");
        }
    }

    /// Releases the block behind `ptr` and merges it with its free neighbours.
    ///
    /// The pointer is checked before any metadata is written: it has to be a payload
    /// address inside the heap whose block is allocated and has matching tags.
    /// Rejected pointers leave the heap untouched.
    ///
    /// # Safety
    /// The checks can not tell a live allocation from an arbitrary heap address that
    /// happens to look like one. `ptr` must have been returned by this allocator and
    /// must not have been released since; the payload must not be used afterwards.
    #[instrument(level = "info", skip(self), err(Debug, level = Level::WARN))]
    pub unsafe fn try_free(&mut self, ptr: NonNull<u8>) -> Result<(), MallocError> {
        let heap = self.heap_mut()?;
        unsafe {
            let block = heap.validate(ptr)?;
            heap.release(block);
        }
        Ok(())
    }

    /// Resizes the allocation behind `ptr`, following the C `realloc` contract.
    /// Returns null when the block was released or the request failed; in the latter
    /// case the old block is still valid.
    ///
    /// # Safety
    /// See [`try_realloc`](RawMalloc::try_realloc).
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match unsafe { self.try_realloc(NonNull::new(ptr), size) } {
            Ok(p) => raw_ptr(p),
            Err(err) => {
                error!(%err, ?ptr, size, "Reallocation failed.");
                null_mut()
            }
        }
    }

    /// Resizes the allocation behind `ptr` to hold at least `size` bytes.
    ///
    /// * `None` behaves like [`try_malloc`](RawMalloc::try_malloc);
    /// * a zero `size` releases the block and returns `Ok(None)`;
    /// * growing first tries to absorb a free successor, otherwise the payload is moved;
    /// * shrinking splits the block in place when the tail can form a block of its own.
    ///
    /// # Safety
    /// Same contract as [`try_free`](RawMalloc::try_free). If a new address is returned
    /// the old one must not be used anymore.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::DEBUG))]
    pub unsafe fn try_realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, MallocError> {
        let Some(ptr) = ptr else {
            return self.try_malloc(size);
        };
        if size == 0 {
            unsafe { self.try_free(ptr)? };
            return Ok(None);
        }

        let block_size = adjust_size(size).context(TooLargeSnafu { size })?;
        let heap = self.heap_mut()?;
        let block = unsafe { heap.validate(ptr)? };
        let old_size = unsafe { block.size() };

        if block_size == old_size {
            debug!("Block already has the requested size.");
            return Ok(Some(ptr));
        }
        if block_size < old_size {
            unsafe { heap.shrink(block, block_size) };
            return Ok(Some(ptr));
        }
        if unsafe { heap.try_grow_in_place(block, block_size) } {
            return Ok(Some(ptr));
        }

        debug!("Couldn't grow block in place, moving payload.");
        let new_block = self.allocate(block_size)?;
        unsafe {
            let copy_size = (old_size - TAGS_SIZE).min(new_block.size() - TAGS_SIZE);
            copy_nonoverlapping(ptr.as_ptr(), new_block.payload().as_ptr(), copy_size);
            self.heap_mut()?.release(block);
        }
        Ok(Some(new_block.payload()))
    }

    /// Returns how many payload bytes the allocation behind `ptr` can hold.
    ///
    /// # Safety
    /// Same contract as [`try_free`](RawMalloc::try_free), without releasing.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, MallocError> {
        let block = unsafe { self.heap()?.validate(ptr)? };
        Ok(unsafe { block.size() } - TAGS_SIZE)
    }

    /// Finds (or makes room for) a block of `block_size` bytes and places it.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    fn allocate(&mut self, block_size: usize) -> Result<Block, MallocError> {
        let fit = unsafe { self.heap()?.index.find_fit(block_size) };
        let block = match fit {
            Some(block) => {
                debug!(?block, "Found free block to accommodate object.");
                block
            }
            None => {
                debug!("No free block fits, requesting heap growth.");
                self.extend_heap(block_size.max(self.config.get_chunk_size()))?
            }
        };
        unsafe { self.heap_mut()?.place(block, block_size) };
        Ok(block)
    }

    /// Grows the heap by at least `size` bytes and turns the new space into a free block,
    /// merged with the last block if that one is free. Returns the resulting block,
    /// which is in the index.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn extend_heap(&mut self, size: usize) -> Result<Block, MallocError> {
        let RawMalloc { grower, heap, .. } = self;
        let heap = heap.as_mut().context(UninitializedSnafu)?;

        let size = size
            .checked_next_multiple_of(ALIGNMENT)
            .filter(|&size| heap.len().saturating_add(size) <= MAX_BLOCK_SIZE)
            .context(HeapLimitSnafu { size })?;

        let (old_end, granted) =
            unsafe { grower.grow(size) }.context(OutOfMemorySnafu { size })?;
        ensure!(
            old_end == heap.end,
            NonContiguousSnafu {
                expected: heap.end.as_ptr() as usize,
                found: old_end.as_ptr() as usize,
            }
        );
        heap.end = unsafe { NonNull::new_unchecked(old_end.as_ptr().add(granted)) };

        // Bytes past what a tag word can address stay unused.
        let usable_end = heap.end.as_ptr().min(unsafe {
            heap.index.base().as_ptr().add(MAX_BLOCK_SIZE)
        }) as usize;
        let block = heap.epilogue;
        let block_size = (usable_end - block.addr()) & !(ALIGNMENT - 1);
        ensure!(
            block_size >= size,
            ShortGrowthSnafu {
                requested: size,
                granted: block_size,
            }
        );

        unsafe {
            block.write_tags(block_size, false);
            block.clear_links();
            heap.epilogue = block.next();
            heap.epilogue.write_header(Header::EPILOGUE);
            debug!(?block, block_size, epilogue = ?heap.epilogue, "Heap grown.");

            let block = heap.coalesce(block);
            heap.index.insert(block);
            Ok(block)
        }
    }

    #[inline]
    fn heap(&self) -> Result<&Heap, MallocError> {
        self.heap.as_ref().context(UninitializedSnafu)
    }

    #[inline]
    fn heap_mut(&mut self) -> Result<&mut Heap, MallocError> {
        self.heap.as_mut().context(UninitializedSnafu)
    }
}

impl Heap {
    #[inline]
    fn len(&self) -> usize {
        self.end.as_ptr() as usize - self.index.base().as_ptr() as usize
    }

    #[inline]
    fn prologue(&self) -> Block {
        unsafe {
            Block::from_payload(NonNull::new_unchecked(
                self.index.base().as_ptr().add(INDEX_SIZE + WORD_SIZE),
            ))
        }
    }

    #[inline]
    fn first_block(&self) -> Block {
        unsafe {
            Block::from_payload(NonNull::new_unchecked(
                self.prologue().payload().as_ptr().add(PROLOGUE_SIZE),
            ))
        }
    }

    /// Checks that `ptr` is the payload of an allocated block of this heap.
    ///
    /// # Safety
    /// The heap must be consistent.
    unsafe fn validate(&self, ptr: NonNull<u8>) -> Result<Block, MallocError> {
        let addr = ptr.as_ptr() as usize;
        ensure!(
            addr % ALIGNMENT == 0
                && addr >= self.first_block().addr()
                && addr < self.epilogue.addr(),
            ForeignPointerSnafu { addr }
        );

        let block = Block::from_payload(ptr);
        let header = unsafe { block.header() };
        ensure!(
            header.is_well_formed()
                && header.size() >= MIN_BLOCK_SIZE
                && header.size() <= self.epilogue.addr() - addr,
            CorruptTagsSnafu { addr }
        );
        ensure!(header.is_allocated(), NotAllocatedSnafu { addr });
        ensure!(unsafe { block.footer() } == header, CorruptTagsSnafu { addr });
        Ok(block)
    }

    /// Removes `block` from the index and marks its first `block_size` bytes allocated.
    /// The rest is split off as a new free block when it can hold a minimum block.
    ///
    /// # Safety
    /// `block` must be an indexed free block of at least `block_size` bytes.
    #[instrument(level = "debug", skip(self))]
    unsafe fn place(&mut self, block: Block, block_size: usize) {
        let size = unsafe { block.size() };
        debug_assert!(size >= block_size);
        unsafe { self.index.remove(block) };

        if size - block_size >= MIN_BLOCK_SIZE {
            let rest = unsafe {
                block.write_tags(block_size, true);
                let rest = block.next();
                rest.write_tags(size - block_size, false);
                rest.clear_links();
                self.index.insert(rest);
                rest
            };
            debug!(?rest, rest_size = size - block_size, "Split off free remainder.");
        } else {
            unsafe { block.write_tags(size, true) };
            debug!(slack = size - block_size, "Remainder too small, allocating whole block.");
        }
    }

    /// Marks `block` free, merges it with its free neighbours and indexes the result.
    ///
    /// # Safety
    /// `block` must be an allocated block of this heap.
    #[instrument(level = "debug", skip(self))]
    unsafe fn release(&mut self, block: Block) {
        unsafe {
            block.write_tags(block.size(), false);
            block.clear_links();
            let block = self.coalesce(block);
            self.index.insert(block);
        }
    }

    /// Boundary-tag coalescing. Merges the (not yet indexed) free `block` with
    /// free neighbours, pulling them out of the index, and returns the merged block.
    ///
    /// # Safety
    /// `block` must be a free block of this heap that is not in the index.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let (prev_allocated, next, size) =
            unsafe { (block.prev_footer().is_allocated(), block.next(), block.size()) };
        let next_allocated = unsafe { next.is_allocated() };

        match (prev_allocated, next_allocated) {
            (true, true) => block,
            (true, false) => {
                let size = unsafe {
                    self.index.remove(next);
                    let size = size + next.size();
                    block.write_tags(size, false);
                    size
                };
                debug!(?block, size, "Merged with next block.");
                block
            }
            (false, true) => {
                let (prev, size) = unsafe {
                    let prev = block.prev();
                    self.index.remove(prev);
                    let size = size + prev.size();
                    prev.write_tags(size, false);
                    (prev, size)
                };
                debug!(block = ?prev, size, "Merged with previous block.");
                prev
            }
            (false, false) => {
                let (prev, size) = unsafe {
                    let prev = block.prev();
                    self.index.remove(prev);
                    self.index.remove(next);
                    let size = size + prev.size() + next.size();
                    prev.write_tags(size, false);
                    (prev, size)
                };
                debug!(block = ?prev, size, "Merged with both neighbours.");
                prev
            }
        }
    }

    /// Cuts an allocated block down to `block_size` bytes. The tail becomes a free
    /// block, merged with a free successor, if it can hold a minimum block.
    ///
    /// # Safety
    /// `block` must be an allocated block larger than `block_size`.
    #[instrument(level = "debug", skip(self))]
    unsafe fn shrink(&mut self, block: Block, block_size: usize) {
        let size = unsafe { block.size() };
        if size - block_size < MIN_BLOCK_SIZE {
            debug!(slack = size - block_size, "Tail too small to split, keeping block.");
            return;
        }
        let rest = unsafe {
            block.write_tags(block_size, true);
            let rest = block.next();
            rest.write_tags(size - block_size, false);
            rest.clear_links();
            let rest = self.coalesce(rest);
            self.index.insert(rest);
            rest
        };
        debug!(?rest, "Released tail of shrunk block.");
    }

    /// Grows an allocated block to at least `block_size` bytes by absorbing its
    /// successor whole, if that one is free and large enough.
    ///
    /// # Safety
    /// `block` must be an allocated block smaller than `block_size`.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    unsafe fn try_grow_in_place(&mut self, block: Block, block_size: usize) -> bool {
        let next = unsafe { block.next() };
        if unsafe { next.is_allocated() } {
            return false;
        }
        let size = unsafe { block.size() + next.size() };
        if size < block_size {
            return false;
        }
        unsafe {
            self.index.remove(next);
            block.write_tags(size, true);
        }
        true
    }
}

#[cfg(test)]
mod tests;
