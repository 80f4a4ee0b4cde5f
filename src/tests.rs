extern crate std;

use core::ptr::NonNull;
use core::slice;
use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    AllocError, AllocInitError, Buddy, ExplicitList, FixedBrk, GlobalBrk, Placement, SegFit,
};
use crate::sink::BrkSink;

/// One interface over the three variants so the property tests can be
/// written once.
trait Mm {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;
    unsafe fn free(&mut self, ptr: NonNull<u8>);
    unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize)
        -> Result<NonNull<u8>, AllocError>;
    fn check(&self);
}

macro_rules! impl_mm {
    ($ty:ident) => {
        impl Mm for $ty<GlobalBrk> {
            fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
                $ty::allocate(self, size)
            }

            unsafe fn free(&mut self, ptr: NonNull<u8>) {
                unsafe { $ty::free(self, ptr) }
            }

            unsafe fn reallocate(
                &mut self,
                ptr: NonNull<u8>,
                size: usize,
            ) -> Result<NonNull<u8>, AllocError> {
                unsafe { $ty::reallocate(self, ptr, size) }
            }

            fn check(&self) {
                self.check_invariants();
            }
        }
    };
}

impl_mm!(ExplicitList);
impl_mm!(SegFit);
impl_mm!(Buddy);

enum AllocatorOpTag {
    Allocate,
    Free,
    Realloc,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer of `len` bytes.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
    /// Resize an existing allocation, selected as for `Free`, to `len`
    /// bytes.
    Realloc { index: usize, len: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 14;

/// Sink capacity backing each property-test allocator.
const PROP_CAPACITY: usize = 4 << 20;

fn arbitrary_len(g: &mut Gen) -> usize {
    // Try to distribute allocations evenly between powers of two.
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Free,
                AllocatorOpTag::Realloc,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: arbitrary_len(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
            AllocatorOpTag::Realloc => AllocatorOp::Realloc {
                index: usize::arbitrary(g),
                len: arbitrary_len(g),
            },
        }
    }
}

struct Allocation {
    id: u64,
    ptr: NonNull<u8>,
    len: usize,
}

unsafe fn paint(ptr: NonNull<u8>, len: usize, id: u64) {
    let slice = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) };

    for (byte, value) in slice.iter_mut().zip(id.to_le_bytes().into_iter().cycle()) {
        *byte = value;
    }
}

unsafe fn verify(ptr: NonNull<u8>, len: usize, id: u64) -> bool {
    let slice = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };

    slice
        .iter()
        .zip(id.to_le_bytes().into_iter().cycle())
        .all(|(byte, value)| *byte == value)
}

/// Drives an allocator through `ops`, painting every live payload with the
/// id of the operation that produced it and verifying the bytes whenever
/// an allocation is resized or released.
fn exercise<M: Mm>(mut alloc: M, ops: Vec<AllocatorOp>) -> bool {
    let mut allocations: Vec<Allocation> = Vec::with_capacity(ops.len());

    for (op_id, op) in ops.into_iter().enumerate() {
        let id = op_id as u64;

        match op {
            AllocatorOp::Allocate { len } => {
                let ptr = match alloc.allocate(len) {
                    Ok(p) => p,
                    Err(AllocError) => continue,
                };

                unsafe { paint(ptr, len, id) };
                allocations.push(Allocation { id, ptr, len });
            }

            AllocatorOp::Free { index } => {
                if allocations.is_empty() {
                    continue;
                }

                let a = allocations.swap_remove(index % allocations.len());
                if unsafe { !verify(a.ptr, a.len, a.id) } {
                    return false;
                }

                unsafe { alloc.free(a.ptr) };
            }

            AllocatorOp::Realloc { index, len } => {
                if allocations.is_empty() {
                    continue;
                }

                let idx = index % allocations.len();
                let a = allocations.swap_remove(idx);

                if len == 0 {
                    // A zero-size resize frees the block and reports failure.
                    assert!(unsafe { alloc.reallocate(a.ptr, 0) }.is_err());
                    continue;
                }

                match unsafe { alloc.reallocate(a.ptr, len) } {
                    Ok(ptr) => {
                        let keep = core::cmp::min(a.len, len);
                        if unsafe { !verify(ptr, keep, a.id) } {
                            return false;
                        }

                        unsafe { paint(ptr, len, id) };
                        allocations.push(Allocation { id, ptr, len });
                    }

                    // The block is untouched on failure.
                    Err(AllocError) => allocations.push(a),
                }
            }
        }

        alloc.check();
    }

    true
}

#[test]
fn explicit_allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let sink = GlobalBrk::with_capacity(PROP_CAPACITY).unwrap();
        exercise(ExplicitList::try_new(sink).unwrap(), ops)
    }

    QuickCheck::new().quickcheck(prop as fn(_) -> bool);
}

#[test]
fn explicit_first_fit_allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let sink = GlobalBrk::with_capacity(PROP_CAPACITY).unwrap();
        let alloc = ExplicitList::try_new_with_placement(sink, Placement::FirstFit).unwrap();
        exercise(alloc, ops)
    }

    QuickCheck::new().quickcheck(prop as fn(_) -> bool);
}

#[test]
fn segfit_allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let sink = GlobalBrk::with_capacity(PROP_CAPACITY).unwrap();
        exercise(SegFit::try_new(sink).unwrap(), ops)
    }

    QuickCheck::new().quickcheck(prop as fn(_) -> bool);
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let sink = GlobalBrk::with_capacity(PROP_CAPACITY).unwrap();
        exercise(Buddy::try_new(sink).unwrap(), ops)
    }

    QuickCheck::new().quickcheck(prop as fn(_) -> bool);
}

fn small_explicit() -> ExplicitList<GlobalBrk> {
    ExplicitList::try_new(GlobalBrk::with_capacity(1 << 20).unwrap()).unwrap()
}

fn small_segfit() -> SegFit<GlobalBrk> {
    SegFit::try_new(GlobalBrk::with_capacity(1 << 20).unwrap()).unwrap()
}

fn small_buddy() -> Buddy<GlobalBrk> {
    Buddy::try_new(GlobalBrk::with_capacity(1 << 20).unwrap()).unwrap()
}

#[test]
fn zero_capacity_sink_is_rejected() {
    assert!(matches!(
        GlobalBrk::with_capacity(0),
        Err(AllocInitError::InvalidConfig)
    ));
}

#[test]
fn zero_size_requests_fail() {
    assert_eq!(small_explicit().allocate(0), Err(AllocError));
    assert_eq!(small_segfit().allocate(0), Err(AllocError));
    assert_eq!(small_buddy().allocate(0), Err(AllocError));
}

#[test]
fn returned_pointers_are_8_aligned() {
    let mut alloc = small_segfit();

    for size in [1, 7, 8, 9, 24, 100, 1000, 4095] {
        let ptr = alloc.allocate(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 8, 0, "size {size}");
    }

    alloc.check_invariants();
}

#[test]
fn one_byte_request_gets_minimum_block() {
    let mut alloc = small_segfit();

    let p = alloc.allocate(1).unwrap();
    assert_eq!(unsafe { alloc.payload_size(p) }, 8);
    assert_eq!(unsafe { alloc.class_of_block(p) }, 0);

    unsafe { alloc.free(p) };
    alloc.check_invariants();

    // The freed block merged back into the heap's single extent, and the
    // same address comes back out for the same request.
    let q = alloc.allocate(1).unwrap();
    assert_eq!(q, p);
}

#[test]
fn adjacent_frees_coalesce_into_the_original_extent() {
    let mut alloc = small_segfit();

    // The initial heap is one free block of 4096 + 16 bytes; two 2048-byte
    // blocks and the leftover sliver tile it exactly.
    let a = alloc.allocate(2040).unwrap();
    let b = alloc.allocate(2040).unwrap();

    unsafe {
        alloc.free(a);
        alloc.free(b);
    }
    alloc.check_invariants();

    // If coalescing restored a single block, the whole extent is allocatable
    // in place.
    let c = alloc.allocate(4104).unwrap();
    assert_eq!(c, a);
}

#[test]
fn three_neighbors_coalesce_across_orders() {
    let mut alloc = small_segfit();

    let a = alloc.allocate(8).unwrap();
    let b = alloc.allocate(8).unwrap();
    let c = alloc.allocate(8).unwrap();
    // Keep an allocated block above `c` so the merge is bounded.
    let _guard = alloc.allocate(8).unwrap();

    unsafe {
        alloc.free(a);
        alloc.free(c);
        alloc.free(b);
    }
    alloc.check_invariants();

    // Three 16-byte blocks fused into one 48-byte block, filed under
    // class 1, and reusable from its original address.
    let d = alloc.allocate(40).unwrap();
    assert_eq!(d, a);
    assert_eq!(unsafe { alloc.payload_size(d) }, 40);
    assert_eq!(unsafe { alloc.class_of_block(d) }, 1);
}

#[test]
fn realloc_shrink_stays_in_place() {
    let mut alloc = small_segfit();

    let a = alloc.allocate(100).unwrap();
    unsafe { paint(a, 100, 7) };

    let b = unsafe { alloc.reallocate(a, 50) }.unwrap();
    assert_eq!(b, a);
    assert!(unsafe { verify(b, 50, 7) });

    alloc.check_invariants();
}

#[test]
fn realloc_grow_absorbs_free_neighbor() {
    let mut alloc = small_segfit();

    let a = alloc.allocate(100).unwrap();
    let b = alloc.allocate(100).unwrap();
    unsafe { paint(a, 100, 11) };

    // Freeing `b` leaves a free block directly above `a`.
    unsafe { alloc.free(b) };

    let grown = unsafe { alloc.reallocate(a, 150) }.unwrap();
    assert_eq!(grown, a);
    assert!(unsafe { verify(grown, 100, 11) });

    alloc.check_invariants();
}

#[test]
fn realloc_grow_moves_and_keeps_prefix() {
    let mut alloc = small_segfit();

    let a = alloc.allocate(100).unwrap();
    // The neighbor stays allocated, so growth must relocate.
    let _b = alloc.allocate(100).unwrap();
    unsafe { paint(a, 100, 13) };

    let moved = unsafe { alloc.reallocate(a, 5000) }.unwrap();
    assert_ne!(moved, a);
    assert!(unsafe { verify(moved, 100, 13) });

    alloc.check_invariants();
}

#[test]
fn realloc_to_zero_frees() {
    let mut alloc = small_segfit();

    let a = alloc.allocate(100).unwrap();
    assert!(unsafe { alloc.reallocate(a, 0) }.is_err());

    alloc.check_invariants();
}

#[test]
fn explicit_placement_policies_differ() {
    let pick = |placement: Placement| {
        let sink = GlobalBrk::with_capacity(1 << 20).unwrap();
        let mut alloc = ExplicitList::try_new_with_placement(sink, placement).unwrap();

        let a = alloc.allocate(40).unwrap(); // 48-byte block
        let _g1 = alloc.allocate(8).unwrap();
        let c = alloc.allocate(24).unwrap(); // 32-byte block
        let _g2 = alloc.allocate(8).unwrap();

        unsafe {
            alloc.free(c);
            alloc.free(a);
        }
        alloc.check_invariants();

        // Free list, LIFO from the head: a (48), c (32), then the large
        // remainder of the initial extension.
        let chosen = alloc.allocate(24).unwrap();
        alloc.check_invariants();
        (a, c, chosen)
    };

    let (a, _, first) = pick(Placement::FirstFit);
    assert_eq!(first, a);

    let (_, c, best) = pick(Placement::BestFit);
    assert_eq!(best, c);

    let (a, c, worst) = pick(Placement::WorstFit);
    assert_ne!(worst, a);
    assert_ne!(worst, c);
}

#[test]
fn buddy_rounds_to_powers_of_two() {
    let mut alloc = small_buddy();

    let a = alloc.allocate(100).unwrap();
    assert_eq!(unsafe { alloc.payload_size(a) }, 120);

    unsafe { alloc.free(a) };
    alloc.check_invariants();

    // The split chain reassembles on free, so the same request carves the
    // same address back out.
    let b = alloc.allocate(100).unwrap();
    assert_eq!(b, a);
}

#[test]
fn buddy_merges_reassemble_the_region() {
    let mut alloc = small_buddy();

    let a = alloc.allocate(2000).unwrap();
    let b = alloc.allocate(2000).unwrap();

    unsafe {
        alloc.free(a);
        alloc.free(b);
    }
    alloc.check_invariants();

    let c = alloc.allocate(4000).unwrap();
    assert_eq!(c, a);
}

#[test]
fn buddy_blocks_align_to_their_size() {
    let mut alloc = small_buddy();
    let lo = alloc.sink().heap_lo().as_ptr() as usize;

    let mut held = Vec::new();
    for size in [1, 9, 24, 60, 100, 250, 500, 1000] {
        let ptr = alloc.allocate(size).unwrap();
        let block_size = unsafe { alloc.payload_size(ptr) } + 8;

        // Offsets are taken from the buddy lattice origin: the first block
        // header, one word below the first payload.
        let ofs = ptr.as_ptr() as usize - 4 - (lo + 12);
        assert_eq!(ofs % block_size, 0, "size {size}");
        held.push(ptr);
    }

    for ptr in held {
        unsafe { alloc.free(ptr) };
    }
    alloc.check_invariants();
}

#[test]
fn failed_allocation_leaves_the_heap_usable() {
    // Room for the prefix, the initial extension, and nothing else.
    let sink = GlobalBrk::with_capacity(4144).unwrap();
    let mut alloc = ExplicitList::try_new(sink).unwrap();

    let a = alloc.allocate(100).unwrap();
    assert_eq!(alloc.allocate(100_000), Err(AllocError));
    alloc.check_invariants();

    // The failure consumed nothing.
    let b = alloc.allocate(100).unwrap();
    unsafe {
        alloc.free(a);
        alloc.free(b);
    }
    alloc.check_invariants();
}

#[test]
fn sink_accessors_track_the_break() {
    let mut alloc = small_explicit();

    // Prefix (8 words) plus the initial extension.
    assert_eq!(alloc.sink().heap_size(), 32 + 4096);
    let lo = alloc.sink().heap_lo().as_ptr() as usize;

    // A request beyond the current heap forces an extension.
    let big = alloc.allocate(8000).unwrap();

    assert_eq!(alloc.sink().heap_lo().as_ptr() as usize, lo);
    assert!(alloc.sink().heap_size() > 4128);
    assert_eq!(
        alloc.sink().heap_hi().as_ptr() as usize - lo,
        alloc.sink().heap_size()
    );

    unsafe { alloc.free(big) };
    alloc.check_invariants();
}

#[test]
fn fixed_brk_backs_an_allocator() {
    // An 8-aligned buffer by way of a Vec<u64> kept alive across the test.
    let mut buf: Vec<u64> = vec![0; 8192];
    let region = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

    // SAFETY: the buffer outlives the allocator and is not otherwise
    // accessed while it is alive.
    let sink = unsafe { FixedBrk::new(region, buf.len() * 8) };

    let mut alloc = SegFit::try_new(sink).unwrap();

    let a = alloc.allocate(1000).unwrap();
    unsafe { paint(a, 1000, 3) };

    let b = alloc.allocate(2000).unwrap();
    unsafe { paint(b, 2000, 4) };

    assert!(unsafe { verify(a, 1000, 3) });
    assert!(unsafe { verify(b, 2000, 4) });

    unsafe {
        alloc.free(a);
        alloc.free(b);
    }
    alloc.check_invariants();

    drop(alloc);
    drop(buf);
}
