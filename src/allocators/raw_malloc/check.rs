//! Heap consistency checker.

use std::collections::BTreeSet;

use super::{Heap, RawMalloc, PROLOGUE_SIZE};
use crate::block::MIN_BLOCK_SIZE;
use crate::error::{
    BadEpilogueSnafu, BadHeaderSnafu, BadPrologueSnafu, BrokenLinkSnafu, HeapCheckError,
    NotInitializedSnafu, OutOfBoundsSnafu, TagMismatchSnafu, UncoalescedSnafu, UnindexedSnafu,
    UnknownBlockSnafu, WrongClassSnafu,
};
use crate::freelist::{size_class, CLASS_COUNT};
use crate::growers::Grower;
use crate::header::{Header, ALIGNMENT};

use snafu::{ensure, OptionExt};
use tracing::{debug, instrument, Level};

/// A summary of the heap, produced by a successful [`RawMalloc::check_heap`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the grower.
    pub heap_len: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Size of the largest free block, 0 if there is none.
    pub largest_free: usize,
}

impl<T: Grower> RawMalloc<T> {
    /// Walks every block and every bucket and verifies the heap invariants:
    ///
    /// * prologue and epilogue are intact;
    /// * every block is aligned, lies inside the heap and has matching tags;
    /// * no two adjacent blocks are free;
    /// * the index holds exactly the free blocks, each once, in the bucket of its size,
    ///   with consistent back links.
    ///
    /// This is a debugging aid: it takes time linear in the number of blocks.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub fn check_heap(&self) -> Result<HeapStats, HeapCheckError> {
        let heap = self.heap.as_ref().context(NotInitializedSnafu)?;
        unsafe { heap.check() }
    }
}

impl Heap {
    unsafe fn check(&self) -> Result<HeapStats, HeapCheckError> {
        let prologue = self.prologue();
        let (header, footer) = unsafe { (prologue.header(), prologue.footer()) };
        let expected = Header::new(PROLOGUE_SIZE, true);
        ensure!(
            header == expected && footer == expected,
            BadPrologueSnafu { header, footer }
        );

        let mut stats = HeapStats {
            heap_len: self.len(),
            ..HeapStats::default()
        };
        let mut free = BTreeSet::new();
        let mut prev_free = false;
        let mut block = self.first_block();

        while block.addr() < self.epilogue.addr() {
            let addr = block.addr();
            // Sizes are multiples of the alignment, so every step stays aligned.
            debug_assert_eq!(addr % ALIGNMENT, 0);

            let header = unsafe { block.header() };
            ensure!(
                header.is_well_formed() && header.size() >= MIN_BLOCK_SIZE,
                BadHeaderSnafu { addr, header }
            );
            ensure!(
                header.size() <= self.epilogue.addr() - addr,
                OutOfBoundsSnafu { addr }
            );
            let footer = unsafe { block.footer() };
            ensure!(footer == header, TagMismatchSnafu { addr, header, footer });

            if header.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += header.size();
            } else {
                ensure!(!prev_free, UncoalescedSnafu { addr });
                stats.free_blocks += 1;
                stats.free_bytes += header.size();
                stats.largest_free = stats.largest_free.max(header.size());
                free.insert(addr);
            }
            prev_free = !header.is_allocated();
            block = unsafe { block.next() };
        }

        let header = unsafe { block.header() };
        ensure!(
            block == self.epilogue && header == Header::EPILOGUE,
            BadEpilogueSnafu {
                addr: block.addr(),
                header
            }
        );

        for class in 0..CLASS_COUNT {
            let mut prev = None;
            let mut cursor = unsafe { self.index.head(class) };
            while let Some(block) = cursor {
                let addr = block.addr();
                // Removing on visit also catches cycles and blocks linked twice.
                ensure!(free.remove(&addr), UnknownBlockSnafu { class, addr });
                let size = unsafe { block.size() };
                ensure!(size_class(size) == class, WrongClassSnafu { addr, size, class });
                ensure!(
                    unsafe { self.index.prev_of(block) } == prev,
                    BrokenLinkSnafu { addr }
                );
                prev = Some(block);
                cursor = unsafe { self.index.next_of(block) };
            }
        }
        if let Some(&addr) = free.first() {
            return UnindexedSnafu { addr }.fail();
        }

        debug!(?stats, "Heap is consistent.");
        Ok(stats)
    }
}
