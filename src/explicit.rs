//! An explicit-free-list allocator.
//!
//! All free blocks are threaded onto one doubly-linked list through their
//! payload words, in LIFO order. Placement walks the list under the
//! configured [`Placement`] policy, and frees merge eagerly with both
//! neighbors using boundary tags.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case             |
//! |--------------------------|-----------|------------------------|
//! | Allocate                 | O(1)      | O(free blocks)         |
//! | Free                     | O(1)      | O(1)                   |
//! | Reallocate               | O(1)      | O(free blocks) + copy  |
//!
//! #### Fragmentation
//!
//! Splitting leaves remainders back on the list and coalescing is
//! immediate, so external fragmentation stays bounded by the placement
//! policy's quality. Internal fragmentation is at most the minimum block
//! size minus a word.

use core::{
    cmp, fmt,
    num::NonZeroU32,
    ptr::{self, NonNull},
};

use crate::base::FreeLinks;
use crate::heap::{hdr, Heap};
use crate::sink::BrkSink;
use crate::word::{
    is_alloc, pack, padded_request, unpacked_size, CHUNKSIZE, DSIZE, MIN_BLOCK, WSIZE,
};
use crate::{AllocError, AllocInitError, Placement};

/// Heap prefix: padding, prologue header/footer, a seed free block of four
/// words, and the epilogue.
const PREFIX: u32 = 8 * WSIZE;

/// Payload offset of the seed free block written at initialization.
const SEED_BP: u32 = 4 * WSIZE;

/// An allocator indexing its free blocks on a single LIFO list.
pub struct ExplicitList<S: BrkSink> {
    heap: Heap<S>,
    head: Option<NonZeroU32>,
    placement: Placement,
}

impl<S: BrkSink> ExplicitList<S> {
    /// Attempts to construct a new `ExplicitList` over `sink` with the
    /// default (best-fit) placement policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot supply the heap prefix and one
    /// extension quantum, or if the sink's region is not 8-aligned.
    pub fn try_new(sink: S) -> Result<ExplicitList<S>, AllocInitError> {
        Self::try_new_with_placement(sink, Placement::default())
    }

    /// Attempts to construct a new `ExplicitList` over `sink` using
    /// `placement` to choose among fitting free blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot supply the heap prefix and one
    /// extension quantum, or if the sink's region is not 8-aligned.
    pub fn try_new_with_placement(
        sink: S,
        placement: Placement,
    ) -> Result<ExplicitList<S>, AllocInitError> {
        let mut heap = Heap::bootstrap(sink, PREFIX)?;

        let seed = NonZeroU32::new(SEED_BP).unwrap();
        heap.put(0, 0);
        heap.set_boundary_tags(NonZeroU32::new(2 * WSIZE).unwrap(), DSIZE, true);
        heap.set_boundary_tags(seed, MIN_BLOCK, false);
        heap.set_links(
            seed,
            FreeLinks {
                pred: None,
                succ: None,
            },
        );
        heap.put(PREFIX - WSIZE, pack(0, true));

        let mut list = ExplicitList {
            heap,
            head: Some(seed),
            placement,
        };

        list.extend_heap((CHUNKSIZE / WSIZE) as usize).map_err(|_| {
            AllocInitError::AllocFailed(
                core::alloc::Layout::from_size_align(CHUNKSIZE as usize, DSIZE as usize).unwrap(),
            )
        })?;

        Ok(list)
    }

    /// Attempts to allocate a block with room for `size` bytes of payload.
    ///
    /// The returned pointer is 8-aligned. Zero-size requests are refused.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero or the sink cannot grow the heap far
    /// enough. A failed allocation leaves the heap unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let asize = padded_request(size).ok_or(AllocError)?;

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

    /// Deallocates the block behind `ptr` and merges it with any free
    /// neighbor.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this allocator. It
    /// is invalidated by this call, along with any pointer into its payload.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let bp = self.heap.offset_of(ptr);
        let size = self.heap.block_size(bp);

        self.heap.set_boundary_tags(bp, size, false);
        self.coalesce(bp);
    }

    /// Resizes the block behind `ptr` to hold at least `new_size` bytes.
    ///
    /// Shrinking always succeeds in place. Growth first tries to absorb a
    /// free block immediately above; otherwise the payload moves to a fresh
    /// allocation and the old block is freed. If `new_size` is zero the
    /// block is freed and `Err` is returned.
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
        let need = u32::try_from(new_size)
            .ok()
            .and_then(|s| s.checked_add(DSIZE))
            .ok_or(AllocError)?;

        if need <= old_size {
            return Ok(ptr);
        }

        // Absorb the next block if it is free and brings enough room. The
        // epilogue reads as allocated, but check its zero size explicitly so
        // the absorb path can never reach past the heap's end.
        let next = self.heap.next_bp(bp);
        let next_word = self.heap.word(hdr(next));
        if !is_alloc(next_word) && unpacked_size(next_word) != 0 {
            let grown = old_size + unpacked_size(next_word);
            if need <= grown {
                self.remove(next);
                self.heap.set_boundary_tags(bp, grown, true);
                return Ok(ptr);
            }
        }

        let new_ptr = self.allocate(need as usize)?;
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
    fn extend_heap(&mut self, words: usize) -> Result<NonZeroU32, AllocError> {
        let bp = self.heap.extend_block(words, true).ok_or(AllocError)?;
        Ok(self.coalesce(bp))
    }

    /// Pushes `bp` onto the head of the free list.
    fn insert(&mut self, bp: NonZeroU32) {
        let old = self.head;
        self.heap.set_links(
            bp,
            FreeLinks {
                pred: None,
                succ: old,
            },
        );

        if let Some(old) = old {
            // SAFETY: `old` is a free block on the list; `&mut self` makes
            // the reference unique.
            unsafe { self.heap.base().links_mut(old) }.pred = Some(bp);
        }

        self.head = Some(bp);
    }

    /// Unlinks `bp` from the free list.
    ///
    /// The head is recognized by identity, not by its `pred` link: a block
    /// promoted to head by a previous head-removal keeps a stale `pred`
    /// until the next insertion rewrites it.
    fn remove(&mut self, bp: NonZeroU32) {
        if self.head == Some(bp) {
            self.head = self.heap.links(bp).succ;
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

    /// Selects a free block of at least `asize` bytes, per the placement
    /// policy.
    fn search(&self, asize: u32) -> Option<NonZeroU32> {
        let mut chosen: Option<(NonZeroU32, u32)> = None;
        let mut cur = self.head;

        while let Some(bp) = cur {
            let size = self.heap.block_size(bp);

            if size >= asize {
                match self.placement {
                    Placement::FirstFit => return Some(bp),
                    Placement::BestFit => {
                        if chosen.map_or(true, |(_, best)| size < best) {
                            chosen = Some((bp, size));
                        }
                    }
                    Placement::WorstFit => {
                        if chosen.map_or(true, |(_, worst)| size > worst) {
                            chosen = Some((bp, size));
                        }
                    }
                }
            }

            cur = self.heap.links(bp).succ;
        }

        chosen.map(|(bp, _)| bp)
    }

    /// Carves an `asize`-byte allocated block out of the free block at
    /// `bp`, splitting off the remainder when it can stand alone.
    fn place(&mut self, bp: NonZeroU32, asize: u32) {
        self.remove(bp);
        let csize = self.heap.block_size(bp);

        if csize - asize >= MIN_BLOCK {
            self.heap.set_boundary_tags(bp, asize, true);

            let rest = NonZeroU32::new(bp.get() + asize).unwrap();
            self.heap.set_boundary_tags(rest, csize - asize, false);
            self.insert(rest);
        } else {
            self.heap.set_boundary_tags(bp, csize, true);
        }
    }

    /// Merges the free block at `bp` with free neighbors and indexes the
    /// result.
    ///
    /// The prologue footer and the epilogue header both read as allocated,
    /// so merging can never walk off either end of the heap.
    fn coalesce(&mut self, mut bp: NonZeroU32) -> NonZeroU32 {
        // The previous block's footer sits directly below this header.
        let prev_alloc = is_alloc(self.heap.word(bp.get() - DSIZE));
        let next = self.heap.next_bp(bp);
        let next_alloc = self.heap.block_alloc(next);
        let mut size = self.heap.block_size(bp);

        match (prev_alloc, next_alloc) {
            (true, true) => {}
            (true, false) => {
                self.remove(next);
                size += self.heap.block_size(next);
                self.heap.set_boundary_tags(bp, size, false);
            }
            (false, true) => {
                let prev = self.heap.prev_bp(bp);
                self.remove(prev);
                size += self.heap.block_size(prev);
                self.heap.set_boundary_tags(prev, size, false);
                bp = prev;
            }
            (false, false) => {
                let prev = self.heap.prev_bp(bp);
                self.remove(prev);
                self.remove(next);
                size += self.heap.block_size(prev) + self.heap.block_size(next);
                self.heap.set_boundary_tags(prev, size, false);
                bp = prev;
            }
        }

        self.insert(bp);
        bp
    }
}

impl<S: BrkSink> fmt::Debug for ExplicitList<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitList")
            .field("brk", &self.heap.brk())
            .field("head", &self.head)
            .field("placement", &self.placement)
            .finish()
    }
}

#[cfg(test)]
impl<S: BrkSink> ExplicitList<S> {
    /// Walks the whole heap and the free list, asserting the structural
    /// invariants: block sizing and alignment, matching boundary tags,
    /// eager coalescing, and agreement between tag state and list
    /// membership.
    pub(crate) fn check_invariants(&self) {
        extern crate std;
        use std::collections::BTreeSet;

        let mut free_blocks = BTreeSet::new();

        let mut bp = NonZeroU32::new(SEED_BP).unwrap();
        let mut prev_free = false;
        loop {
            let word = self.heap.word(hdr(bp));
            let size = unpacked_size(word);
            if size == 0 {
                assert!(is_alloc(word), "epilogue must read as allocated");
                assert_eq!(hdr(bp), self.heap.brk() - WSIZE);
                break;
            }

            assert!(size >= MIN_BLOCK);
            assert_eq!(size % DSIZE, 0);
            assert_eq!(bp.get() % DSIZE, 0);
            assert_eq!(word, self.heap.word(self.heap.ftr(bp)), "boundary tags differ");

            if !is_alloc(word) {
                assert!(!prev_free, "adjacent free blocks at {bp}");
                free_blocks.insert(bp);
            }
            prev_free = !is_alloc(word);

            bp = self.heap.next_bp(bp);
        }

        let mut listed = BTreeSet::new();
        let mut cur = self.head;
        while let Some(bp) = cur {
            assert!(listed.insert(bp), "free list cycles through {bp}");
            assert!(!self.heap.block_alloc(bp));
            cur = self.heap.links(bp).succ;
        }

        assert_eq!(free_blocks, listed, "free list disagrees with the heap");
    }
}
