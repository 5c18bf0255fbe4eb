//! [`Grower`] trait and structures that implement it.
//!
//! The [`Grower`] trait is the heap-growth primitive that
//! [`RawMalloc`](crate::RawMalloc) builds on: something that acts like a contiguous
//! buffer whose end can be pushed further, the way `sbrk` pushes the program break.

use crate::error::{ExhaustedSnafu, GrowError, OverflowSnafu};
use crate::header::ALIGNMENT;
use crate::util::{checked_add, find_aligned};

use core::ptr::NonNull;

use libc::{brk, sbrk};
use snafu::OptionExt;
use tracing::debug;

/// A trait for types that act as if they were a contiguous growable buffer.
///
/// # Safety
/// * copying, cloning, or moving the grower must not invalidate any pointers to the buffer
///   managed by the grower. This generally means that growers should not own but
///   reference their underlying buffers.
/// * successive growths must be contiguous: the old end returned by a growth is the
///   new end of the previous one.
pub unsafe trait Grower {
    /// Grows the underlying buffer with at least `size` bytes.
    /// Returns the old end of the buffer and the size of the growth.
    ///
    /// # Safety
    /// Implementors should ensure that `grow(0)` does not grow the buffer.
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), GrowError>;
}

#[derive(Debug)]
/// A grower that internally uses [`libc::brk`] to operate
/// on the end of the process's data segment.
pub struct BrkGrower {
    heap_end: Option<NonNull<u8>>,
    min_increment: usize,
}

impl BrkGrower {
    /// Creates a grower that never moves the break by less than `min_increment` bytes.
    ///
    /// # Safety
    /// There must not be any other object (grower or not) managing the program break
    /// through `brk`/`sbrk` for as long as the grower is used.
    #[inline(always)]
    pub const unsafe fn new(min_increment: usize) -> Self {
        BrkGrower {
            heap_end: None,
            min_increment,
        }
    }

    /// Reads the initial break with `sbrk(0)` and rounds it up to [`ALIGNMENT`].
    unsafe fn try_init(&mut self) -> Result<NonNull<u8>, GrowError> {
        debug_assert!(self.heap_end.is_none());
        let heap_end = unsafe { sbrk(0) };
        debug_assert_ne!(heap_end as isize, -1, "Calling sbrk(0) should never fail.");
        let aligned = find_aligned(heap_end.cast(), ALIGNMENT)
            .and_then(|p| NonNull::new(p as *mut u8))
            .context(OverflowSnafu { size: 0_usize })?;
        debug!(break_start = ?aligned, "Initialized brk grower.");
        self.heap_end = Some(aligned);
        Ok(aligned)
    }
}

unsafe impl Grower for BrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), GrowError> {
        let heap_end = match self.heap_end {
            Some(end) => end,
            None => unsafe { self.try_init()? },
        };
        if size == 0 {
            return Ok((heap_end, 0));
        }
        let size = size.max(self.min_increment);
        let new_heap_end = checked_add(heap_end.as_ptr(), size).context(OverflowSnafu { size })?;
        if unsafe { brk(new_heap_end as *mut libc::c_void) == -1 } {
            return ExhaustedSnafu { size }.fail();
        }
        self.heap_end = unsafe { Some(NonNull::new_unchecked(new_heap_end as *mut u8)) };
        Ok((heap_end, size))
    }
}

/// A grower that carves a caller-provided buffer.
///
/// Useful for heaps with a hard size limit and for running several independent
/// heaps side by side.
#[derive(Debug)]
pub struct ArenaGrower {
    heap_end: NonNull<u8>,
    arena_end: *mut u8,
    min_increment: usize,
}

impl ArenaGrower {
    /// Creates a new arena that operates on the provided buffer.
    ///
    /// # Safety
    /// `buf` must be valid for reads and writes of `size` bytes for as long as the
    /// grower (or any allocator built on it) is used, and nothing else may access
    /// that memory in the meantime.
    pub unsafe fn new(buf: NonNull<u8>, size: usize, min_increment: usize) -> Self {
        ArenaGrower {
            heap_end: buf,
            arena_end: unsafe { buf.as_ptr().add(size) },
            min_increment,
        }
    }

    /// Returns how many bytes the arena can still hand out.
    pub fn remaining(&self) -> usize {
        self.arena_end as usize - self.heap_end.as_ptr() as usize
    }
}

unsafe impl Grower for ArenaGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), GrowError> {
        let heap_end = self.heap_end;
        if size == 0 {
            return Ok((heap_end, 0));
        }
        let size = size.max(self.min_increment);
        if size > self.remaining() {
            return ExhaustedSnafu { size }.fail();
        }
        self.heap_end = unsafe { NonNull::new_unchecked(heap_end.as_ptr().add(size)) };
        Ok((heap_end, size))
    }
}

unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), GrowError> {
        unsafe { (**self).grow(size) }
    }
}
