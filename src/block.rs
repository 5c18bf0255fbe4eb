//! The in-band layout of a heap block.
//!
//! ```text
//!           payload (8-aligned)
//!           v
//!  +--------+--------+--------+--- ... ---+--------+
//!  | header |  prev  |  next  |           | footer |
//!  +--------+--------+--------+--- ... ---+--------+
//!  <------------------- size ---------------------->
//! ```
//!
//! The `prev`/`next` words only mean something while the block is free; once it is
//! allocated they belong to the caller like the rest of the payload.

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::header::{Header, ALIGNMENT, WORD_SIZE};

/// Header, two link words and footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD_SIZE;

/// Bytes of a block that never belong to the payload.
pub const TAGS_SIZE: usize = 2 * WORD_SIZE;

/// Largest size a tag word can describe. Also bounds the whole heap, since links are
/// offsets of the same width.
pub const MAX_BLOCK_SIZE: usize = u32::MAX as usize & !(ALIGNMENT - 1);

const_assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);

/// Free-list link fields, stored as byte offsets from the heap base.
/// An offset of `0` means "no block".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Links {
    pub prev: u32,
    pub next: u32,
}

const_assert!(core::mem::size_of::<Links>() + TAGS_SIZE == MIN_BLOCK_SIZE);

/// A block, identified by the address of its payload.
///
/// This is a plain address: holding a `Block` says nothing about the state of the
/// memory behind it. Every accessor is therefore unsafe and assumes the address is
/// the payload of a block with well-formed tags inside a live heap.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block(NonNull<u8>);

impl Block {
    #[inline(always)]
    pub fn from_payload(payload: NonNull<u8>) -> Block {
        Block(payload)
    }

    #[inline(always)]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline(always)]
    unsafe fn header_ptr(self) -> *mut u32 {
        unsafe { self.0.as_ptr().sub(WORD_SIZE).cast() }
    }

    #[inline(always)]
    unsafe fn footer_ptr(self) -> *mut u32 {
        unsafe { self.0.as_ptr().add(self.size() - TAGS_SIZE).cast() }
    }

    /// Reads the header tag.
    ///
    /// # Safety
    /// The word in front of the payload must lie inside the heap.
    #[inline(always)]
    pub unsafe fn header(self) -> Header {
        Header::from_raw(unsafe { self.header_ptr().read() })
    }

    /// Reads the footer tag, located through the size stored in the header.
    ///
    /// # Safety
    /// The header must hold the size of this block.
    #[inline(always)]
    pub unsafe fn footer(self) -> Header {
        Header::from_raw(unsafe { self.footer_ptr().read() })
    }

    /// # Safety
    /// See [`Block::header`].
    #[inline(always)]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header() }.size()
    }

    /// # Safety
    /// See [`Block::header`].
    #[inline(always)]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.header() }.is_allocated()
    }

    /// Writes identical header and footer tags for a block of `size` bytes.
    ///
    /// # Safety
    /// The whole `size`-byte range of the block must lie inside the heap and must not
    /// overlap any block still in use.
    #[inline(always)]
    pub unsafe fn write_tags(self, size: usize, allocated: bool) {
        let tag = Header::new(size, allocated);
        unsafe {
            self.header_ptr().write(tag.raw());
            self.footer_ptr().write(tag.raw());
        }
    }

    /// Overwrites only the header. Used for the zero-sized epilogue,
    /// which has no footer.
    ///
    /// # Safety
    /// The word in front of the payload must lie inside the heap.
    #[inline(always)]
    pub unsafe fn write_header(self, tag: Header) {
        unsafe { self.header_ptr().write(tag.raw()) };
    }

    /// Returns the block that starts right after this one.
    ///
    /// # Safety
    /// The header must hold the size of this block.
    #[inline(always)]
    pub unsafe fn next(self) -> Block {
        unsafe { Block(NonNull::new_unchecked(self.0.as_ptr().add(self.size()))) }
    }

    /// Returns the footer of the block that ends right before this one.
    ///
    /// # Safety
    /// A block (or the prologue) must precede this one.
    #[inline(always)]
    pub unsafe fn prev_footer(self) -> Header {
        Header::from_raw(unsafe { self.0.as_ptr().sub(TAGS_SIZE).cast::<u32>().read() })
    }

    /// Returns the block that ends right before this one.
    ///
    /// # Safety
    /// See [`Block::prev_footer`].
    #[inline(always)]
    pub unsafe fn prev(self) -> Block {
        unsafe {
            let size = self.prev_footer().size();
            Block(NonNull::new_unchecked(self.0.as_ptr().sub(size)))
        }
    }

    /// Reads the free-list links.
    ///
    /// # Safety
    /// The block must be at least [`MIN_BLOCK_SIZE`] bytes.
    #[inline(always)]
    pub unsafe fn links(self) -> Links {
        unsafe { self.0.as_ptr().cast::<Links>().read() }
    }

    /// # Safety
    /// See [`Block::links`]. The block must not be allocated.
    #[inline(always)]
    pub unsafe fn set_links(self, links: Links) {
        unsafe { self.0.as_ptr().cast::<Links>().write(links) }
    }

    /// # Safety
    /// See [`Block::set_links`].
    #[inline(always)]
    pub unsafe fn set_prev(self, prev: u32) {
        unsafe { (*self.0.as_ptr().cast::<Links>()).prev = prev };
    }

    /// # Safety
    /// See [`Block::set_links`].
    #[inline(always)]
    pub unsafe fn set_next(self, next: u32) {
        unsafe { (*self.0.as_ptr().cast::<Links>()).next = next };
    }

    /// # Safety
    /// See [`Block::set_links`].
    #[inline(always)]
    pub unsafe fn clear_links(self) {
        unsafe { self.set_links(Links::default()) };
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block({:p})", self.0)
    }
}
