//! A small library for ~~hating on~~ evaluating the correctness of
//! malloc-style heap allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of
//! [`AllocatorOp`]s, painting every payload with the id of the operation
//! that produced it. Bytes are verified when an allocation is released, and
//! across reallocations the surviving prefix must match the old paint, so
//! overlapping blocks, lost splits, and bad copies all surface as byte
//! mismatches.

#![deny(unsafe_op_in_unsafe_fn)]

use core::{cmp, ptr::NonNull, slice};

use arbitrary::Arbitrary;

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 14;

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Free,
    Realloc,
}

/// One step of an allocator workload.
#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a buffer of the given size in bytes.
    Alloc(usize),
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free(usize),
    /// Resize an existing allocation, selected as for `Free`, to the given
    /// size in bytes.
    Realloc(usize, usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        fn arbitrary_size(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<usize> {
            // Spread sizes evenly across the powers of two up to the limit.
            let exp = u8::arbitrary(u)? % (ALLOC_LIMIT_BITS + 1);
            Ok(usize::arbitrary(u)? % 2_usize.pow(exp.into()))
        }

        let op = match AllocatorOpTag::arbitrary(u)? {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(arbitrary_size(u)?),
            AllocatorOpTag::Free => AllocatorOp::Free(usize::arbitrary(u)?),
            AllocatorOpTag::Realloc => {
                AllocatorOp::Realloc(usize::arbitrary(u)?, arbitrary_size(u)?)
            }
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
///
/// The three operations mirror the malloc package contract: sizes are plain
/// byte counts, pointers are 8-aligned payload addresses, and a zero-size
/// reallocation frees the block and reports failure.
pub trait Subject {
    /// The subject's allocation failure type.
    type AllocError;

    /// Allocates a block with room for `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError>;

    /// Deallocates the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this subject.
    unsafe fn free(&mut self, ptr: NonNull<u8>);

    /// Resizes the block at `ptr` to `size` bytes.
    ///
    /// On success the first `min(old, size)` payload bytes must be
    /// preserved. On failure the old block must be untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this subject.
    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError>;
}

struct Block {
    // A pointer to the payload.
    ptr: NonNull<u8>,
    // The requested size, in bytes.
    len: usize,
    // The unique id of the last operation that painted this block.
    id: u64,
}

unsafe fn paint(ptr: NonNull<u8>, len: usize, id: u64) {
    let slice = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        *byte = value;
    }
}

unsafe fn matches_paint(ptr: NonNull<u8>, len: usize, id: u64) -> bool {
    let slice = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
}

/// Drives a [`Subject`] through operation sequences and checks the bytes.
pub struct Evaluator<S: Subject> {
    subject: S,
}

/// The evidence returned when a subject corrupts a payload.
#[derive(Clone, Debug)]
pub struct Failed {
    /// Every operation completed before the failure.
    pub completed: Vec<AllocatorOp>,
    /// The operation that observed the corruption.
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    /// Wraps `subject` for evaluation.
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    /// Runs `ops` against the subject.
    ///
    /// Failed allocations are skipped; corrupted payload bytes abort the run
    /// with the evidence collected so far.
    pub fn evaluate(&mut self, ops: impl IntoIterator<Item = AllocatorOp>) -> Result<(), Failed> {
        let mut completed = Vec::new();
        let mut blocks: Vec<Block> = Vec::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let id: u64 = op_id.try_into().unwrap();

            match op {
                AllocatorOp::Alloc(len) => {
                    let ptr = match self.subject.allocate(len) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    // SAFETY: the subject handed out `len` writable bytes.
                    unsafe { paint(ptr, len, id) };
                    blocks.push(Block { ptr, len, id });
                }

                AllocatorOp::Free(raw_idx) => {
                    if blocks.is_empty() {
                        continue;
                    }

                    let block = blocks.swap_remove(raw_idx % blocks.len());

                    // SAFETY: the block is live and `len` bytes long.
                    if unsafe { !matches_paint(block.ptr, block.len, block.id) } {
                        return Err(Failed {
                            completed,
                            failed_op: op,
                        });
                    }

                    // SAFETY: the block was allocated by this subject.
                    unsafe { self.subject.free(block.ptr) };
                }

                AllocatorOp::Realloc(raw_idx, len) => {
                    if blocks.is_empty() {
                        continue;
                    }

                    let block = blocks.swap_remove(raw_idx % blocks.len());

                    if len == 0 {
                        // Zero-size resizes free the block and report failure.
                        // SAFETY: the block was allocated by this subject.
                        let result = unsafe { self.subject.reallocate(block.ptr, 0) };
                        assert!(result.is_err(), "zero-size reallocation returned a block");
                        completed.push(op);
                        continue;
                    }

                    // SAFETY: the block was allocated by this subject.
                    match unsafe { self.subject.reallocate(block.ptr, len) } {
                        Ok(ptr) => {
                            let keep = cmp::min(block.len, len);

                            // SAFETY: the subject handed out `len` bytes, of
                            // which the first `keep` must carry the old paint.
                            if unsafe { !matches_paint(ptr, keep, block.id) } {
                                return Err(Failed {
                                    completed,
                                    failed_op: op,
                                });
                            }

                            // SAFETY: as above.
                            unsafe { paint(ptr, len, id) };
                            blocks.push(Block { ptr, len, id });
                        }

                        // The old block is untouched on failure.
                        Err(_) => blocks.push(block),
                    }
                }
            }

            completed.push(op);
        }

        Ok(())
    }
}
