//! Defines the [`Header`] boundary tag and the layout constants built around it.

use core::mem::size_of;

use static_assertions::const_assert;

/// Size of a tag word and of a free-list link field.
pub const WORD_SIZE: usize = size_of::<Header>();

/// Alignment of every payload and granularity of every block size.
pub const ALIGNMENT: usize = 2 * WORD_SIZE;

/// Mask of the low bits that never take part in a block size.
const FLAG_MASK: u32 = (ALIGNMENT - 1) as u32;

/// Bit that marks a block as allocated.
const ALLOCATED: u32 = 1;

const_assert!(WORD_SIZE == 4);
const_assert!(ALIGNMENT.is_power_of_two());

/// A boundary tag: one word carrying a block's size and allocation status.
///
/// Every block holds two identical copies, one in front of the payload (the header)
/// and one in its last word (the footer), so its neighbours can be reached
/// from either end in *O*(1).
///
/// # Tagging
/// Block sizes are always multiples of [`ALIGNMENT`], so the three low bits of the
/// size are free. The lowest of them stores the allocated flag, the other two
/// are always zero.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u32);

impl Header {
    /// The tag of the zero-sized epilogue block.
    pub const EPILOGUE: Header = Header(ALLOCATED);

    /// Packs `size` and `allocated` into a tag.
    ///
    /// # Panics
    /// In debug builds, panics if `size` is not a multiple of [`ALIGNMENT`]
    /// or does not fit in a tag word.
    #[inline(always)]
    pub fn new(size: usize, allocated: bool) -> Header {
        debug_assert_eq!(size % ALIGNMENT, 0, "size should be a multiple of {ALIGNMENT}.");
        debug_assert!(size <= u32::MAX as usize, "size should fit in a tag word.");
        Header(size as u32 | if allocated { ALLOCATED } else { 0 })
    }

    /// Reinterprets a raw word read from the heap.
    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Header {
        Header(raw)
    }

    /// Returns the raw word as stored in the heap.
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the total block size, header and footer included.
    #[inline(always)]
    pub const fn size(self) -> usize {
        (self.0 & !FLAG_MASK) as usize
    }

    #[inline(always)]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    /// Returns whether the reserved bits are clear, i.e. whether the word could
    /// have been produced by [`Header::new`].
    #[inline(always)]
    pub const fn is_well_formed(self) -> bool {
        self.0 & FLAG_MASK & !ALLOCATED == 0
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[{}:{}]",
            self.size(),
            if self.is_allocated() { 'a' } else { 'f' }
        )
    }
}
