//! A binary-buddy allocator.
//!
//! Block sizes are always powers of two, so a block's partner in any merge
//! is fully determined by address arithmetic: for a block of size `s` at
//! offset `o` from the buddy region base, the buddy sits at `o XOR s`. That
//! makes footers unnecessary, and frees walk only forward. Free blocks are
//! filed into the same per-class lists as the segregated-fit allocator,
//! with class `i` holding blocks of exactly `2^i` bytes.

use core::{
    cmp, fmt,
    num::NonZeroU32,
    ptr::{self, NonNull},
};

use crate::base::FreeLinks;
use crate::heap::{hdr, Heap};
use crate::segfit::SIZE_CLASSES;
use crate::sink::BrkSink;
use crate::word::{is_alloc, pack, padded_pow2_request, unpacked_size, CHUNKSIZE, DSIZE, WSIZE};
use crate::{AllocError, AllocInitError};

/// Heap prefix: padding, prologue header/footer, epilogue.
const PREFIX: u32 = 4 * WSIZE;

/// Payload offset of the first real block.
#[cfg(test)]
const FIRST_BP: u32 = PREFIX;

/// Returns the index of the class list for blocks of `size` bytes: the
/// smallest `i` with `2^i >= size`, clamped to the last class.
fn class_of(size: u32) -> usize {
    debug_assert!(size >= 2);

    let ceil_log2 = (u32::BITS - (size - 1).leading_zeros()) as usize;
    cmp::min(ceil_log2, SIZE_CLASSES - 1)
}

/// An allocator managing power-of-two blocks with address-derived merges.
pub struct Buddy<S: BrkSink> {
    heap: Heap<S>,
    roots: [Option<NonZeroU32>; SIZE_CLASSES],
    /// Offset of the buddy lattice origin: where the first block's header
    /// landed when the heap was bootstrapped.
    region: u32,
}

impl<S: BrkSink> Buddy<S> {
    /// Attempts to construct a new `Buddy` over `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot supply the heap prefix and one
    /// extension quantum, or if the sink's region is not 8-aligned.
    pub fn try_new(sink: S) -> Result<Buddy<S>, AllocInitError> {
        let mut heap = Heap::bootstrap(sink, PREFIX)?;

        heap.put(0, 0);
        heap.set_boundary_tags(NonZeroU32::new(2 * WSIZE).unwrap(), DSIZE, true);
        heap.put(PREFIX - WSIZE, pack(0, true));

        let region = heap.brk() - WSIZE;
        let mut buddy = Buddy {
            heap,
            roots: [None; SIZE_CLASSES],
            region,
        };

        buddy.extend_heap((CHUNKSIZE / WSIZE) as usize).map_err(|_| {
            AllocInitError::AllocFailed(
                core::alloc::Layout::from_size_align(CHUNKSIZE as usize, DSIZE as usize).unwrap(),
            )
        })?;

        Ok(buddy)
    }

    /// Attempts to allocate a block with room for `size` bytes of payload.
    ///
    /// The block is sized to the smallest power of two holding the payload
    /// and a double word of overhead. Zero-size requests are refused.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero or the sink cannot grow the heap far
    /// enough. A failed allocation leaves the heap unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let asize = padded_pow2_request(size).ok_or(AllocError)?;

        let bp = match self.search(asize) {
            Some(bp) => bp,
            None => {
                let extend = cmp::max(asize, CHUNKSIZE);
                self.extend_heap((extend / WSIZE) as usize)?
            }
        };

        self.place(bp, asize);
        Ok(self.heap.payload(bp))
    }

    /// Deallocates the block behind `ptr` and merges it with its buddy as
    /// far as the lattice allows.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this allocator. It
    /// is invalidated by this call, along with any pointer into its payload.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let bp = self.heap.offset_of(ptr);
        let size = self.heap.block_size(bp);

        self.heap.set_header(bp, size, false);
        self.coalesce(bp);
    }

    /// Resizes the block behind `ptr` to hold at least `new_size` bytes.
    ///
    /// A request that still fits the block's power of two succeeds in
    /// place; anything larger moves the payload to a fresh allocation and
    /// frees the old block. If `new_size` is zero the block is freed and
    /// `Err` is returned.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the heap cannot be grown to satisfy the request;
    /// the original block is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this allocator. On
    /// `Ok`, the old pointer is invalidated unless the returned pointer is
    /// equal to it.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if new_size == 0 {
            // SAFETY: upheld by the caller.
            unsafe { self.free(ptr) };
            return Err(AllocError);
        }

        let bp = self.heap.offset_of(ptr);
        let old_size = self.heap.block_size(bp);
        let need = padded_pow2_request(new_size).ok_or(AllocError)?;

        if need <= old_size {
            return Ok(ptr);
        }

        let new_ptr = self.allocate(new_size)?;
        let copy = cmp::min((old_size - DSIZE) as usize, new_size);

        // SAFETY: both blocks are live and disjoint, and `copy` does not
        // exceed either payload.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy) };

        // SAFETY: upheld by the caller.
        unsafe { self.free(ptr) };
        Ok(new_ptr)
    }

    /// Returns the usable payload capacity of the block behind `ptr`.
    ///
    /// This is at least the size the block was requested with.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this allocator.
    pub unsafe fn payload_size(&self, ptr: NonNull<u8>) -> usize {
        (self.heap.block_size(self.heap.offset_of(ptr)) - DSIZE) as usize
    }

    /// Returns a reference to the underlying sink, for diagnostics.
    #[inline]
    pub fn sink(&self) -> &S {
        self.heap.sink()
    }

    /// Grows the heap and hands the new memory to the coalescer.
    ///
    /// Extensions are written without footers; the buddy lattice never
    /// walks backward.
    fn extend_heap(&mut self, words: usize) -> Result<NonZeroU32, AllocError> {
        let bp = self.heap.extend_block(words, false).ok_or(AllocError)?;
        Ok(self.coalesce(bp))
    }

    /// Pushes `bp` onto the head of its class list.
    fn insert(&mut self, bp: NonZeroU32) {
        let class = class_of(self.heap.block_size(bp));
        let old = self.roots[class];

        self.heap.set_links(
            bp,
            FreeLinks {
                pred: None,
                succ: old,
            },
        );

        if let Some(old) = old {
            // SAFETY: `old` is a free block on the class list; `&mut self`
            // makes the reference unique.
            unsafe { self.heap.base().links_mut(old) }.pred = Some(bp);
        }

        self.roots[class] = Some(bp);
    }

    /// Unlinks `bp` from its class list.
    fn remove(&mut self, bp: NonZeroU32) {
        let class = class_of(self.heap.block_size(bp));

        if self.roots[class] == Some(bp) {
            self.roots[class] = self.heap.links(bp).succ;
            return;
        }

        let links = self.heap.links(bp);
        let pred = links.pred.unwrap();

        // SAFETY: `pred` and `succ` are distinct free blocks on the list;
        // `&mut self` makes the references unique.
        unsafe { self.heap.base().links_mut(pred) }.succ = links.succ;
        if let Some(succ) = links.succ {
            unsafe { self.heap.base().links_mut(succ) }.pred = links.pred;
        }
    }

    /// Selects a free block of at least `asize` bytes.
    ///
    /// Every block in a class has exactly that class's power-of-two size,
    /// so the head of the first non-empty class at or above the request's
    /// class fits; the caller splits it down.
    fn search(&self, asize: u32) -> Option<NonZeroU32> {
        for class in class_of(asize)..SIZE_CLASSES {
            if let Some(bp) = self.roots[class] {
                return Some(bp);
            }
        }

        None
    }

    /// Consumes the free block at `bp` for an `asize`-byte allocation,
    /// halving it toward the target and filing each split-off upper half.
    fn place(&mut self, bp: NonZeroU32, asize: u32) {
        self.remove(bp);
        let mut csize = self.heap.block_size(bp);

        while csize > asize {
            csize >>= 1;

            let half = NonZeroU32::new(bp.get() + csize).unwrap();
            self.heap.set_header(half, csize, false);
            self.insert(half);
        }

        self.heap.set_header(bp, csize, true);
    }

    /// Merges the free block at `bp` with its buddy for as long as both
    /// halves of a pair are free and neither has been sub-split.
    ///
    /// The size-equality test is the critical guard: a buddy that has been
    /// split further carries a smaller size in its header and must not
    /// merge, or the merged block would swallow live allocations.
    fn coalesce(&mut self, mut bp: NonZeroU32) -> NonZeroU32 {
        self.insert(bp);
        let mut csize = self.heap.block_size(bp);

        loop {
            let ofs = hdr(bp) - self.region;
            let (left, right) = if ofs & csize != 0 {
                (NonZeroU32::new(bp.get() - csize).unwrap(), bp)
            } else {
                (bp, NonZeroU32::new(bp.get() + csize).unwrap())
            };

            // The word above the last block is the epilogue, which reads as
            // allocated, so the right probe never leaves the heap.
            let left_word = self.heap.word(hdr(left));
            let right_word = self.heap.word(hdr(right));

            if is_alloc(left_word)
                || is_alloc(right_word)
                || unpacked_size(left_word) != unpacked_size(right_word)
            {
                break;
            }

            self.remove(left);
            self.remove(right);
            csize <<= 1;
            self.heap.set_header(left, csize, false);
            self.insert(left);
            bp = left;
        }

        bp
    }
}

impl<S: BrkSink> fmt::Debug for Buddy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("brk", &self.heap.brk())
            .field("region", &self.region)
            .field("roots", &self.roots)
            .finish()
    }
}

#[cfg(test)]
impl<S: BrkSink> Buddy<S> {
    /// Walks the whole heap and every class list, asserting the structural
    /// invariants: power-of-two sizing, alignment, list membership, class
    /// placement, and the absence of mergeable buddy pairs.
    pub(crate) fn check_invariants(&self) {
        extern crate std;
        use std::collections::{BTreeMap, BTreeSet};

        let mut free_blocks = BTreeMap::new();

        let mut bp = NonZeroU32::new(FIRST_BP).unwrap();
        loop {
            let word = self.heap.word(hdr(bp));
            let size = unpacked_size(word);
            if size == 0 {
                assert!(is_alloc(word), "epilogue must read as allocated");
                assert_eq!(hdr(bp), self.heap.brk() - WSIZE);
                break;
            }

            assert!(size.is_power_of_two() && size >= 16);
            assert_eq!(bp.get() % DSIZE, 0);

            if !is_alloc(word) {
                free_blocks.insert(hdr(bp) - self.region, size);
            }

            bp = self.heap.next_bp(bp);
        }

        for (&ofs, &size) in &free_blocks {
            let buddy = ofs ^ size;
            assert_ne!(
                free_blocks.get(&buddy),
                Some(&size),
                "unmerged buddy pair at offsets {ofs} and {buddy}"
            );
        }

        let mut listed = BTreeSet::new();
        for (class, root) in self.roots.iter().enumerate() {
            let mut cur = *root;
            while let Some(bp) = cur {
                assert!(listed.insert(bp), "free lists cycle through {bp}");
                let size = self.heap.block_size(bp);
                assert!(!self.heap.block_alloc(bp));
                assert_eq!(class_of(size), class, "block {bp} filed under the wrong class");
                cur = self.heap.links(bp).succ;
            }
        }

        let from_heap: BTreeSet<_> = free_blocks
            .keys()
            .map(|&ofs| NonZeroU32::new(ofs + self.region + WSIZE).unwrap())
            .collect();
        assert_eq!(from_heap, listed, "class lists disagree with the heap");
    }
}
