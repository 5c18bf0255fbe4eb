//! Error types returned by growers and allocators.

use snafu::Snafu;

use crate::header::Header;

/// Failure of a [`Grower`](crate::growers::Grower) to extend its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GrowError {
    /// The platform or arena limit has been reached.
    #[snafu(display("cannot grow the region by {size} bytes, limit reached"))]
    Exhausted { size: usize },
    /// The new end would not be addressable.
    #[snafu(display("growing the region by {size} bytes overflows the address space"))]
    Overflow { size: usize },
}

/// Errors reported by [`RawMalloc`](crate::RawMalloc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MallocError {
    #[snafu(display("the heap is already initialized"))]
    AlreadyInitialized,

    #[snafu(display("the heap is not initialized"))]
    Uninitialized,

    #[snafu(display("the grower handed out a region at {addr:#x}, which is not aligned"))]
    MisalignedRegion { addr: usize },

    #[snafu(display("out of memory while growing the heap by {size} bytes"))]
    OutOfMemory { size: usize, source: GrowError },

    /// Growing by `size` bytes would put blocks beyond what a tag word can address.
    #[snafu(display("growing the heap by {size} bytes exceeds the heap size limit"))]
    HeapLimit { size: usize },

    /// The grower's end moved behind the allocator's back.
    #[snafu(display("heap growth is not contiguous, expected {expected:#x}, found {found:#x}"))]
    NonContiguous { expected: usize, found: usize },

    #[snafu(display("the grower added {granted} bytes, {requested} were needed"))]
    ShortGrowth { requested: usize, granted: usize },

    #[snafu(display("a request of {size} bytes cannot be represented"))]
    TooLarge { size: usize },

    /// The pointer lies outside the heap or is not a payload address.
    #[snafu(display("pointer {addr:#x} was not handed out by this heap"))]
    ForeignPointer { addr: usize },

    /// The block is free, typically after a double free.
    #[snafu(display("pointer {addr:#x} does not point to an allocated block"))]
    NotAllocated { addr: usize },

    /// Header and footer of the block disagree.
    #[snafu(display("block at {addr:#x} has corrupt boundary tags"))]
    CorruptTags { addr: usize },
}

/// A violated heap invariant, found by [`RawMalloc::check_heap`](crate::RawMalloc::check_heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapCheckError {
    #[snafu(display("the heap is not initialized"))]
    NotInitialized,

    #[snafu(display("bad prologue {header:?}/{footer:?}"))]
    BadPrologue { header: Header, footer: Header },

    #[snafu(display("bad epilogue {header:?} at {addr:#x}"))]
    BadEpilogue { addr: usize, header: Header },

    #[snafu(display("block at {addr:#x} has invalid header {header:?}"))]
    BadHeader { addr: usize, header: Header },

    #[snafu(display("block at {addr:#x} runs past the epilogue"))]
    OutOfBounds { addr: usize },

    #[snafu(display("block at {addr:#x}: header {header:?} and footer {footer:?} differ"))]
    TagMismatch {
        addr: usize,
        header: Header,
        footer: Header,
    },

    #[snafu(display("free block at {addr:#x} follows another free block"))]
    Uncoalesced { addr: usize },

    #[snafu(display("bucket {class} links to {addr:#x}, which is not a free block"))]
    UnknownBlock { class: usize, addr: usize },

    #[snafu(display("block at {addr:#x} of size {size} sits in bucket {class}"))]
    WrongClass {
        addr: usize,
        size: usize,
        class: usize,
    },

    #[snafu(display("block at {addr:#x} has a broken back link"))]
    BrokenLink { addr: usize },

    #[snafu(display("free block at {addr:#x} is missing from the index"))]
    Unindexed { addr: usize },
}
