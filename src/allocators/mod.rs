//! The [`RawMalloc`] allocator.

pub mod raw_malloc;

pub use raw_malloc::RawMalloc;
