use crate::freelist::size_class;
use crate::growers::ArenaGrower;
use crate::{GrowError, HeapCheckError};

use self::format::logging;

use super::*;


/// A heap backed by an arena of `len` bytes. The buffer is returned alongside the
/// allocator and has to outlive it.
fn arena_heap(len: usize, config: Config) -> (Vec<u64>, RawMalloc<ArenaGrower>) {
    let mut buf = vec![0_u64; len.div_ceil(8)];
    let region = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
    let grower = unsafe { ArenaGrower::new(region, len, 0) };
    let allocator = unsafe { RawMalloc::with_config(grower, config) };
    (buf, allocator)
}

fn init_heap(len: usize) -> (Vec<u64>, RawMalloc<ArenaGrower>) {
    let (buf, mut allocator) = arena_heap(len, Config::default());
    allocator.init().unwrap();
    (buf, allocator)
}

const INITIAL_LEN: usize = BOOTSTRAP_SIZE + 4096;

#[test]
fn test_init_layout() {
    let _log = logging();
    let (buf, allocator) = init_heap(64 * 1024);
    assert_eq!(BOOTSTRAP_SIZE, 80);
    assert_eq!(allocator.heap_len(), INITIAL_LEN);

    let heap = allocator.heap.as_ref().unwrap();
    assert_eq!(heap.index.base().as_ptr(), buf.as_ptr() as *mut u8);
    assert_eq!(heap.prologue().addr() - buf.as_ptr() as usize, INDEX_SIZE + WORD_SIZE);
    assert_eq!(heap.first_block().addr() - buf.as_ptr() as usize, BOOTSTRAP_SIZE);

    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, 4096);
    assert_eq!(stats.allocated_blocks, 0);
}

#[test]
fn test_init_twice() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    assert_eq!(allocator.init(), Err(MallocError::AlreadyInitialized));
    assert_eq!(allocator.heap_len(), INITIAL_LEN);
}

#[test]
fn test_uninitialized() {
    let (_buf, mut allocator) = arena_heap(64 * 1024, Config::default());
    assert!(!allocator.is_initialized());
    assert!(allocator.malloc(16).is_null());
    assert_eq!(allocator.try_malloc(16), Err(MallocError::Uninitialized));
    assert_eq!(allocator.check_heap(), Err(HeapCheckError::NotInitialized));
    assert_eq!(allocator.heap_len(), 0);
}

#[test]
fn test_init_out_of_memory() {
    let (_buf, mut allocator) = arena_heap(BOOTSTRAP_SIZE - 8, Config::default());
    assert!(matches!(
        allocator.init(),
        Err(MallocError::OutOfMemory {
            source: GrowError::Exhausted { .. },
            ..
        })
    ));
    assert!(!allocator.is_initialized());

    // The sentinels fit but the first chunk doesn't.
    let (_buf, mut allocator) = arena_heap(BOOTSTRAP_SIZE + 64, Config::default());
    assert!(allocator.init().is_err());
    assert_eq!(allocator.check_heap().unwrap().free_blocks, 0);
}

#[test]
fn test_zero_size() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    assert!(allocator.malloc(0).is_null());
    assert_eq!(allocator.try_malloc(0), Ok(None));
    assert_eq!(allocator.heap_len(), INITIAL_LEN);
}

#[test]
fn test_too_large() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    assert!(allocator.malloc(usize::MAX).is_null());
    assert_eq!(
        allocator.try_malloc(usize::MAX),
        Err(MallocError::TooLarge { size: usize::MAX })
    );
    allocator.check_heap().unwrap();
}

#[test]
fn test_alignment_and_no_overlap() {
    let _log = logging();
    let (buf, mut allocator) = init_heap(256 * 1024);
    let heap_start = buf.as_ptr() as usize;

    let mut objects = vec![];
    for size in (1..600).step_by(7) {
        let p = allocator.malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGNMENT, 0);
        objects.push((p as usize, size));
    }

    objects.sort_unstable();
    for pair in objects.windows(2) {
        let (start, size) = pair[0];
        assert!(start + size <= pair[1].0, "{pair:?} overlap");
    }
    for &(start, size) in &objects {
        assert!(start >= heap_start + BOOTSTRAP_SIZE);
        assert!(start + size <= heap_start + allocator.heap_len());
    }
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.allocated_blocks, objects.len());
}

#[test]
fn test_first_fit_reuses_freed_block() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = allocator.malloc(100);
    let b = allocator.malloc(200);
    assert!(!a.is_null() && !b.is_null());
    unsafe { allocator.free(a) };

    let c = allocator.malloc(90);
    assert_eq!(c, a);
    assert_eq!(allocator.heap_len(), INITIAL_LEN);
    allocator.check_heap().unwrap();
}

#[test]
fn test_split_remainder_is_reused() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = allocator.malloc(200);
    let guard = allocator.malloc(8);
    unsafe { allocator.free(a) };

    // 208 bytes split into 24 + 184: the remainder serves the next request.
    let b = allocator.malloc(16);
    assert_eq!(b, a);
    let c = allocator.malloc(100);
    assert_eq!(c, unsafe { a.add(24) });
    assert!(c < guard);
    allocator.check_heap().unwrap();
}

#[test]
fn test_small_remainder_is_not_split() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = allocator.malloc(100);
    let _guard = allocator.malloc(8);
    unsafe { allocator.free(a) };

    // 112-byte block, 104 needed: the 8 spare bytes stay with the allocation.
    let b = allocator.malloc(96);
    assert_eq!(b, a);
    let usable = unsafe { allocator.usable_size(NonNull::new(b).unwrap()) };
    assert_eq!(usable, Ok(104));
}

#[test]
fn test_coalesce_freed_neighbours() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = allocator.malloc(64);
    let b = allocator.malloc(64);
    let c = allocator.malloc(64);
    assert!(!c.is_null());

    unsafe {
        allocator.free(b);
        allocator.free(a);
    }
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_blocks, 2);

    // Two 72-byte blocks merged into 144 bytes: 136 bytes of payload.
    let d = allocator.malloc(136);
    assert_eq!(d, a);
    assert_eq!(allocator.heap_len(), INITIAL_LEN);
    assert_eq!(allocator.check_heap().unwrap().free_blocks, 1);
}

#[test]
fn test_coalesce_cases() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let blocks: Vec<*mut u8> = (0..4).map(|_| allocator.malloc(100)).collect();
    let tail = 4096 - 4 * 112;

    let expect = |allocator: &RawMalloc<ArenaGrower>, free_blocks, largest| {
        let stats = allocator.check_heap().unwrap();
        assert_eq!((stats.free_blocks, stats.largest_free), (free_blocks, largest));
    };

    unsafe {
        // Neither neighbour free.
        allocator.free(blocks[1]);
        expect(&allocator, 2, tail);
        // Only the next block free.
        allocator.free(blocks[0]);
        expect(&allocator, 2, tail);
        // Only the previous block free.
        allocator.free(blocks[2]);
        expect(&allocator, 2, tail);
        // Both free.
        allocator.free(blocks[3]);
        expect(&allocator, 1, 4096);
    }
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_bytes, 4096);
}

#[test]
fn test_heap_growth_merges_with_last_free_block() {
    let _log = logging();
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let p = allocator.malloc(5000);
    assert!(!p.is_null());

    // 5008 bytes requested, merged with the 4096-byte free block, 4096 left over.
    assert_eq!(allocator.heap_len(), INITIAL_LEN + 5008);
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, 4096);
    assert_eq!(stats.allocated_bytes, 5008);
}

#[test]
fn test_growth_by_chunk() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let p = allocator.malloc(4088);
    assert!(!p.is_null());
    assert_eq!(allocator.heap_len(), INITIAL_LEN);

    let q = allocator.malloc(8);
    assert!(!q.is_null());
    assert_eq!(allocator.heap_len(), INITIAL_LEN + 4096);
    assert_eq!(q, unsafe { p.add(4096) });
    allocator.check_heap().unwrap();
}

#[test]
fn test_out_of_memory() {
    let (_buf, mut allocator) = init_heap(INITIAL_LEN);
    assert!(allocator.malloc(5000).is_null());
    assert!(matches!(
        allocator.try_malloc(5000),
        Err(MallocError::OutOfMemory { size: 5008, .. })
    ));

    // The heap is untouched and still serves what fits.
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_bytes, 4096);
    assert!(!allocator.malloc(4000).is_null());
    allocator.check_heap().unwrap();
}

#[test]
fn test_custom_chunk_size() {
    let (_buf, mut allocator) = arena_heap(64 * 1024, Config::new().chunk_size(256));
    allocator.init().unwrap();
    assert_eq!(allocator.heap_len(), BOOTSTRAP_SIZE + 256);

    let p = allocator.malloc(300);
    assert!(!p.is_null());
    // 256 free + 312 requested, 256 left over.
    assert_eq!(allocator.heap_len(), BOOTSTRAP_SIZE + 256 + 312);
    assert_eq!(allocator.check_heap().unwrap().free_bytes, 256);
}

#[test]
fn test_grower_rounds_up() {
    let mut buf = vec![0_u64; 8 * 1024];
    let region = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
    let grower = unsafe { ArenaGrower::new(region, buf.len() * 8, 1001) };
    let mut allocator = unsafe { RawMalloc::with_grower(grower) };
    allocator.init().unwrap();

    // Bootstrap takes 1001 bytes, the first chunk 4096 more.
    assert_eq!(allocator.heap_len(), 1001 + 4096);
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_bytes, (1001 + 4096 - BOOTSTRAP_SIZE) & !7);

    let p = allocator.malloc(8000);
    assert!(!p.is_null());
    allocator.check_heap().unwrap();
    unsafe { allocator.free(p) };
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, (allocator.heap_len() - BOOTSTRAP_SIZE) & !7);
}

/// A grower that leaks a few bytes between growths, like a foreign `sbrk` user would.
struct LeakyGrower(ArenaGrower);

unsafe impl Grower for LeakyGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), GrowError> {
        let grown = self.0.grow(size)?;
        self.0.grow(8)?;
        Ok(grown)
    }
}

#[test]
fn test_non_contiguous_growth() {
    let mut buf = vec![0_u64; 1024];
    let region = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
    let grower = LeakyGrower(unsafe { ArenaGrower::new(region, buf.len() * 8, 0) });
    let mut allocator = unsafe { RawMalloc::with_grower(grower) };
    assert!(matches!(
        allocator.init(),
        Err(MallocError::NonContiguous { .. })
    ));
}

#[test]
fn test_misaligned_region() {
    let mut buf = vec![0_u64; 1024];
    let region = NonNull::new(unsafe { buf.as_mut_ptr().cast::<u8>().add(4) }).unwrap();
    let grower = unsafe { ArenaGrower::new(region, buf.len() * 8 - 4, 0) };
    let mut allocator = unsafe { RawMalloc::with_grower(grower) };
    assert!(matches!(
        allocator.init(),
        Err(MallocError::MisalignedRegion { .. })
    ));
}

#[test]
fn test_realloc_null_and_zero() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.realloc(null_mut(), 50);
        assert!(!p.is_null());
        assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), Ok(56));

        // Same placement as a plain malloc would have picked.
        allocator.free(p);
        let q = allocator.malloc(50);
        assert_eq!(p, q);

        assert!(allocator.realloc(q, 0).is_null());
        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn test_realloc_same_block_size() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(200);
        assert_eq!(allocator.realloc(p, 195), p);
        assert_eq!(allocator.realloc(p, 200), p);
        assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), Ok(200));
    }
}

#[test]
fn test_realloc_shrink_in_place() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(200);
        let guard = allocator.malloc(8);
        p.write_bytes(0x5a, 200);

        // 208 -> 64 bytes: the 144-byte tail becomes a free block.
        let q = allocator.realloc(p, 50);
        assert_eq!(q, p);
        assert_eq!(allocator.usable_size(NonNull::new(q).unwrap()), Ok(56));
        assert!((0..50).all(|i| *q.add(i) == 0x5a));
        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.free_blocks, 2);

        // The tail is found by the next fitting request.
        assert_eq!(allocator.malloc(130), p.add(64));
        assert!(!guard.is_null());
        allocator.check_heap().unwrap();
    }
}

#[test]
fn test_realloc_shrink_keeps_small_slack() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(200);
        // 208 -> 200 bytes: 8 bytes can't form a block.
        assert_eq!(allocator.realloc(p, 190), p);
        assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), Ok(200));
    }
}

#[test]
fn test_realloc_shrink_merges_tail_with_free_successor() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(200);
        assert_eq!(allocator.realloc(p, 20), p);
        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 4096 - 32);
    }
}

#[test]
fn test_realloc_grow_in_place() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(100);
        p.write_bytes(0x11, 100);
        let q = allocator.realloc(p, 1000);
        assert_eq!(q, p);
        // The free successor is absorbed whole.
        assert_eq!(allocator.usable_size(NonNull::new(q).unwrap()), Ok(4096 - 8));
        assert!((0..100).all(|i| *q.add(i) == 0x11));
        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(allocator.heap_len(), INITIAL_LEN);
    }
}

#[test]
fn test_realloc_grow_into_freed_successor() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let a = allocator.malloc(100);
        let b = allocator.malloc(100);
        let _guard = allocator.malloc(100);
        allocator.free(b);
        assert_eq!(allocator.realloc(a, 200), a);
        assert_eq!(allocator.usable_size(NonNull::new(a).unwrap()), Ok(224 - 8));
        allocator.check_heap().unwrap();
    }
}

#[test]
fn test_realloc_moves() {
    let _log = logging();
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let a = allocator.malloc(100);
        let b = allocator.malloc(100);
        for i in 0..100 {
            *a.add(i) = i as u8;
        }

        let c = allocator.realloc(a, 1000);
        assert!(!c.is_null());
        assert_ne!(c, a);
        assert!((0..100).all(|i| *c.add(i) == i as u8));

        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.allocated_blocks, 2);
        // The old block is free again and reused first.
        assert_eq!(allocator.malloc(100), a);
        assert!(!b.is_null());
    }
}

#[test]
fn test_realloc_failure_keeps_block() {
    let (_buf, mut allocator) = init_heap(INITIAL_LEN);
    unsafe {
        let p = allocator.malloc(100);
        let _guard = allocator.malloc(8);
        p.write_bytes(0x77, 100);

        assert!(allocator.realloc(p, 8000).is_null());
        assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), Ok(104));
        assert!((0..100).all(|i| *p.add(i) == 0x77));
        assert_eq!(allocator.check_heap().unwrap().allocated_blocks, 2);
    }
}

#[test]
fn test_realloc_round_trip() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(300);
        let _guard = allocator.malloc(8);
        for i in 0..300 {
            *p.add(i) = (i * 7) as u8;
        }
        let q = allocator.realloc(p, 40);
        let r = allocator.realloc(q, 2000);
        assert!((0..40).all(|i| *r.add(i) == (i * 7) as u8));
        allocator.check_heap().unwrap();
    }
}

#[test]
fn test_invalid_free() {
    let (buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = NonNull::new(allocator.malloc(100)).unwrap();
        let q = NonNull::new(allocator.malloc(100)).unwrap();
        allocator.try_free(p).unwrap();
        assert_eq!(
            allocator.try_free(p),
            Err(MallocError::NotAllocated {
                addr: p.as_ptr() as usize
            })
        );

        let mut local = 0_u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();
        assert!(matches!(
            allocator.try_free(foreign),
            Err(MallocError::ForeignPointer { .. })
        ));

        let misaligned = NonNull::new(q.as_ptr().add(1)).unwrap();
        assert!(matches!(
            allocator.try_free(misaligned),
            Err(MallocError::ForeignPointer { .. })
        ));
        let sentinel = NonNull::new(buf.as_ptr().cast::<u8>().cast_mut().add(72)).unwrap();
        assert!(matches!(
            allocator.try_free(sentinel),
            Err(MallocError::ForeignPointer { .. })
        ));

        // The pointer API logs and carries on.
        allocator.free(p.as_ptr());
        allocator.free(null_mut());
        assert!(allocator.realloc(p.as_ptr(), 10).is_null());

        let stats = allocator.check_heap().unwrap();
        assert_eq!(stats.allocated_blocks, 1);
    }
}

#[test]
fn test_corrupt_tags_are_rejected() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    unsafe {
        let p = allocator.malloc(100);
        let header = p.sub(WORD_SIZE).cast::<u32>();
        header.write(Header::new(120, true).raw());

        assert_eq!(
            allocator.try_free(NonNull::new(p).unwrap()),
            Err(MallocError::CorruptTags { addr: p as usize })
        );
        // The footer is looked up through the bad size and lands on the next header.
        assert_eq!(
            allocator.check_heap(),
            Err(HeapCheckError::TagMismatch {
                addr: p as usize,
                header: Header::new(120, true),
                footer: Header::new(4096 - 112, false),
            })
        );

        header.write(Header::new(112, true).raw());
        allocator.check_heap().unwrap();
    }
}

fn block_of(p: *mut u8) -> Block {
    Block::from_payload(NonNull::new(p).unwrap())
}

fn heap_of(allocator: &mut RawMalloc<ArenaGrower>) -> &mut Heap {
    allocator.heap.as_mut().unwrap()
}

#[test]
fn test_check_bad_prologue() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let prologue = heap_of(&mut allocator).prologue();
    unsafe { prologue.write_header(Header::from_raw(0)) };
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::BadPrologue {
            header: Header::from_raw(0),
            footer: Header::new(PROLOGUE_SIZE, true),
        })
    );
}

#[test]
fn test_check_bad_epilogue() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let epilogue = heap_of(&mut allocator).epilogue;
    unsafe { epilogue.write_header(Header::from_raw(0)) };
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::BadEpilogue {
            addr: epilogue.addr(),
            header: Header::from_raw(0),
        })
    );
}

#[test]
fn test_check_bad_header() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    unsafe {
        let reserved_bits = Header::from_raw(Header::new(112, true).raw() | 0b110);
        a.write_header(reserved_bits);
        assert_eq!(
            allocator.check_heap(),
            Err(HeapCheckError::BadHeader {
                addr: a.addr(),
                header: reserved_bits,
            })
        );

        let too_small = Header::new(8, true);
        a.write_header(too_small);
        assert_eq!(
            allocator.check_heap(),
            Err(HeapCheckError::BadHeader {
                addr: a.addr(),
                header: too_small,
            })
        );
    }
}

#[test]
fn test_check_out_of_bounds() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    unsafe { a.write_header(Header::new(1 << 20, true)) };
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::OutOfBounds { addr: a.addr() })
    );
}

#[test]
fn test_check_tag_mismatch() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    unsafe {
        let footer = a.payload().as_ptr().add(112 - TAGS_SIZE).cast::<u32>();
        footer.write(Header::new(112, false).raw());
    }
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::TagMismatch {
            addr: a.addr(),
            header: Header::new(112, true),
            footer: Header::new(112, false),
        })
    );
}

#[test]
fn test_check_uncoalesced() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let b = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);

    // Free both blocks without merging them.
    let heap = heap_of(&mut allocator);
    unsafe {
        for block in [a, b] {
            block.write_tags(112, false);
            block.clear_links();
            heap.index.insert(block);
        }
    }
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::Uncoalesced { addr: b.addr() })
    );
}

#[test]
fn test_check_unindexed() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    unsafe { a.write_tags(112, false) };
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::Unindexed { addr: a.addr() })
    );
}

#[test]
fn test_check_allocated_block_in_bucket() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    unsafe {
        allocator.free(a.payload().as_ptr());
        // Still linked from its bucket, but marked allocated again.
        a.write_tags(112, true);
    }
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::UnknownBlock {
            class: size_class(112),
            addr: a.addr(),
        })
    );
}

#[test]
fn test_check_wrong_class() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    unsafe { allocator.free(a.payload().as_ptr()) };

    // Re-index the block under a smaller size, then restore its real tags.
    let heap = heap_of(&mut allocator);
    unsafe {
        heap.index.remove(a);
        a.write_tags(64, false);
        heap.index.insert(a);
        a.write_tags(112, false);
    }
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::WrongClass {
            addr: a.addr(),
            size: 112,
            class: size_class(64),
        })
    );
}

#[test]
fn test_check_broken_link() {
    let (_buf, mut allocator) = init_heap(64 * 1024);
    let a = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    let b = block_of(allocator.malloc(100));
    let _guard = allocator.malloc(100);
    unsafe {
        allocator.free(a.payload().as_ptr());
        allocator.free(b.payload().as_ptr());
        // The bucket now reads b, a; a loses its back link to b.
        a.set_prev(0);
    }
    assert_eq!(
        allocator.check_heap(),
        Err(HeapCheckError::BrokenLink { addr: a.addr() })
    );
}

#[test]
fn test_independent_heaps() {
    let (buf_a, mut heap_a) = init_heap(16 * 1024);
    let (buf_b, mut heap_b) = init_heap(16 * 1024);
    let range_a = buf_a.as_ptr() as usize..buf_a.as_ptr() as usize + 16 * 1024;
    let range_b = buf_b.as_ptr() as usize..buf_b.as_ptr() as usize + 16 * 1024;

    let a = heap_a.malloc(100);
    let b = heap_b.malloc(100);
    assert!(range_a.contains(&(a as usize)));
    assert!(range_b.contains(&(b as usize)));
    assert_eq!(a as usize - range_a.start, b as usize - range_b.start);

    unsafe {
        assert!(matches!(
            heap_a.try_free(NonNull::new(b).unwrap()),
            Err(MallocError::ForeignPointer { .. })
        ));
        heap_b.free(b);
    }
    assert_eq!(heap_a.check_heap().unwrap().allocated_blocks, 1);
    assert_eq!(heap_b.check_heap().unwrap().allocated_blocks, 0);
}
