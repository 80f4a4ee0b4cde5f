//! A segregated-fit allocator.
//!
//! Free blocks are partitioned into [`SIZE_CLASSES`] doubly-linked lists by
//! the power of two their size falls under: class `i` holds blocks with
//! `2^(i + 4) <= size < 2^(i + 5)`, so class 0 starts at the minimum block
//! size of 16 and the last class is open-ended. Placement starts at the
//! class of the adjusted request and walks upward, which keeps searches
//! short without giving up the boundary-tag coalescing of the explicit
//! list.

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

/// Number of size-class free lists.
pub const SIZE_CLASSES: usize = 20;

/// Extra bytes added to the first heap extension so that requests just
/// under the extension quantum fit without growing the heap twice.
///
/// This is a tunable, not a law: it papers over a common allocation pattern
/// (a near-4096-byte request arriving first) and any small multiple of the
/// double word works.
pub const DEFAULT_FIRST_EXTEND_SLACK: usize = 2 * DSIZE as usize;

/// Heap prefix: padding, prologue header/footer, epilogue.
const PREFIX: u32 = 4 * WSIZE;

/// Payload offset of the first real block: the first extension starts at
/// the initial break, with its header overwriting the initial epilogue.
#[cfg(test)]
const FIRST_BP: u32 = PREFIX;

/// Returns the index of the class list holding free blocks of `size` bytes.
fn class_of(size: u32) -> usize {
    debug_assert!(size >= MIN_BLOCK);

    let log2 = (u32::BITS - 1 - size.leading_zeros()) as usize;
    cmp::min(log2 - 4, SIZE_CLASSES - 1)
}

/// An allocator indexing its free blocks on per-size-class LIFO lists.
pub struct SegFit<S: BrkSink> {
    heap: Heap<S>,
    roots: [Option<NonZeroU32>; SIZE_CLASSES],
    placement: Placement,
}

impl<S: BrkSink> SegFit<S> {
    /// Attempts to construct a new `SegFit` over `sink` with the default
    /// (best-fit) placement policy and first-extension slack.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot supply the heap prefix and the
    /// first extension, or if the sink's region is not 8-aligned.
    pub fn try_new(sink: S) -> Result<SegFit<S>, AllocInitError> {
        Self::try_new_with(sink, Placement::default(), DEFAULT_FIRST_EXTEND_SLACK)
    }

    /// Attempts to construct a new `SegFit` over `sink` using `placement`
    /// to choose within a class and adding `first_extend_slack` bytes to
    /// the initial heap extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot supply the heap prefix and the
    /// first extension, or if the sink's region is not 8-aligned.
    pub fn try_new_with(
        sink: S,
        placement: Placement,
        first_extend_slack: usize,
    ) -> Result<SegFit<S>, AllocInitError> {
        let mut heap = Heap::bootstrap(sink, PREFIX)?;

        heap.put(0, 0);
        heap.set_boundary_tags(NonZeroU32::new(2 * WSIZE).unwrap(), DSIZE, true);
        heap.put(PREFIX - WSIZE, pack(0, true));

        let mut seg = SegFit {
            heap,
            roots: [None; SIZE_CLASSES],
            placement,
        };

        let first = (CHUNKSIZE as usize).checked_add(first_extend_slack)
            .ok_or(AllocInitError::InvalidConfig)?;
        seg.extend_heap(first / WSIZE as usize).map_err(|_| {
            AllocInitError::AllocFailed(
                core::alloc::Layout::from_size_align(first, DSIZE as usize).unwrap(),
            )
        })?;

        Ok(seg)
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
    ///
    /// The head is recognized by identity, not by its `pred` link: a block
    /// promoted to head by a previous head-removal keeps a stale `pred`
    /// until the next insertion rewrites it.
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
    /// Classes are visited in ascending order starting at the class of
    /// `asize`; within a class the placement policy decides, and a fitting
    /// candidate ends the scan before the next class is visited.
    fn search(&self, asize: u32) -> Option<NonZeroU32> {
        for class in class_of(asize)..SIZE_CLASSES {
            let mut chosen: Option<(NonZeroU32, u32)> = None;
            let mut cur = self.roots[class];

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

            if let Some((bp, _)) = chosen {
                return Some(bp);
            }
        }

        None
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

impl<S: BrkSink> fmt::Debug for SegFit<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegFit")
            .field("brk", &self.heap.brk())
            .field("roots", &self.roots)
            .field("placement", &self.placement)
            .finish()
    }
}

#[cfg(test)]
impl<S: BrkSink> SegFit<S> {
    /// Returns the class index the block behind `ptr` would be filed under.
    pub(crate) unsafe fn class_of_block(&self, ptr: NonNull<u8>) -> usize {
        class_of(self.heap.block_size(self.heap.offset_of(ptr)))
    }

    /// Walks the whole heap and every class list, asserting the structural
    /// invariants: block sizing and alignment, matching boundary tags,
    /// eager coalescing, list membership, and class placement.
    pub(crate) fn check_invariants(&self) {
        extern crate std;
        use std::collections::BTreeSet;

        let mut free_blocks = BTreeSet::new();

        let mut bp = NonZeroU32::new(FIRST_BP).unwrap();
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
        for (class, root) in self.roots.iter().enumerate() {
            let mut cur = *root;
            while let Some(bp) = cur {
                assert!(listed.insert(bp), "free lists cycle through {bp}");
                assert!(!self.heap.block_alloc(bp));
                assert_eq!(
                    class_of(self.heap.block_size(bp)),
                    class,
                    "block {bp} filed under the wrong class"
                );
                cur = self.heap.links(bp).succ;
            }
        }

        assert_eq!(free_blocks, listed, "class lists disagree with the heap");
    }
}
