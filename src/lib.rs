//! A segregated-fit memory allocator with boundary-tag coalescing.
//!
//! The crate provides a drop-in style `malloc`/`free`/`realloc` trio that manages a single
//! contiguous, growable region on its own. All bookkeeping lives inside that region:
//! there is no side table, every block describes itself.
//!
//! # Usage
//! ```
//! use core::ptr::NonNull;
//! use segmalloc::growers::ArenaGrower;
//! use segmalloc::RawMalloc;
//!
//! let mut buf = vec![0_u64; 4096];
//! let region = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
//! let grower = unsafe { ArenaGrower::new(region, buf.len() * 8, 0) };
//! let mut heap = unsafe { RawMalloc::with_grower(grower) };
//! heap.init().expect("heap should initialize");
//!
//! let p = heap.malloc(100);
//! assert!(!p.is_null());
//! unsafe {
//!     p.write_bytes(0xab, 100);
//!     let p = heap.realloc(p, 300);
//!     assert_eq!(*p.add(99), 0xab);
//!     heap.free(p);
//! }
//! heap.check_heap().expect("heap should be consistent");
//! ```
//!
//! # Mode of operation
//! - On allocation the request is turned into a block size and the
//!   [segregated index](#segregated-index) is searched for the first free block that is
//!   large enough. If the block leaves a usable remainder it is split.
//! - If no block fits, the allocator's [grower](#growers) is asked for more memory and the
//!   new space becomes one large free block.
//! - On deallocation the block is merged with whichever of its neighbours are free and the
//!   result is put back into the index, so two free blocks are never adjacent.
//! - Reallocation first tries to stay in place: shrinking splits the block, growing absorbs
//!   a free successor. Only when that fails is the payload moved.
//!
//! Below is a list of the abstractions used by the allocator for operating on the heap:
//!
//! ## Blocks
//! The heap is divided into blocks. A block starts with a header and ends with a footer,
//! both holding the same [boundary tag](#boundary-tags); the payload handed to callers sits
//! between them and is always 8-byte aligned. Block sizes include both tags.
//!
//! ## Boundary tags
//! A tag is a single 32-bit word packing the block size and an allocated bit. Keeping one
//! at each end of a block means that both neighbours of a block can be inspected in
//! constant time, which is what makes immediate coalescing cheap.
//!
//! ## Sentinels
//! The heap is bracketed by a permanently allocated prologue block and a zero-sized,
//! permanently allocated epilogue header. Looking at the previous or the next block is
//! therefore always safe, and growing the heap only means overwriting the epilogue.
//!
//! ## Segregated index
//! Free blocks are threaded into doubly linked lists, one per size class, using the first
//! two payload words of each free block as links. Links are 32-bit offsets from the heap
//! base rather than raw addresses. The list heads form a small array at the very start of
//! the heap. Size classes double in width, so a search starts in the class of the request
//! and moves upwards.
//!
//! ## Growers
//! A grower is the allocator's source of memory. [`RawMalloc`] is generic over its grower:
//! anything that implements [`Grower`] (anything that acts as a contiguous buffer which can
//! grow at its end) can back a heap. [`BrkGrower`] moves the program break;
//! [`ArenaGrower`] hands out a fixed caller-provided buffer, which makes it easy to run
//! several independent heaps side by side.
//!
//! # Threads
//! [`RawMalloc`] is a plain context object driven through `&mut self`. It does no locking
//! of its own; sharing a heap between threads requires wrapping it in a lock.
//!
//! [`Grower`]: growers::Grower
//! [`BrkGrower`]: growers::BrkGrower
//! [`ArenaGrower`]: growers::ArenaGrower

pub use crate::allocators::raw_malloc::HeapStats;
pub use crate::allocators::RawMalloc;
pub use crate::config::Config;
pub use crate::error::{GrowError, HeapCheckError, MallocError};
pub use crate::header::Header;

pub mod allocators;
mod block;
pub mod config;
pub mod error;
mod freelist;
pub mod growers;
mod header;
mod util;
