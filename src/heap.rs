//! Shared heap plumbing: block geometry and heap extension.
//!
//! A [`Heap`] pairs a sink with the base pointer of its region and a mirror
//! of the current break. Blocks are named by the byte offset of their
//! payload (`bp`) from the base; the tag word of a block sits one word below
//! its payload, and boundary-tag arithmetic walks between neighbors:
//!
//! ```text
//! hdr(bp)  = bp - 4
//! ftr(bp)  = bp + size - 8          (variants with footers)
//! next(bp) = bp + size
//! prev(bp) = bp - size(word at bp - 8)
//! ```
//!
//! The last word of the heap is always the epilogue: a zero-size allocated
//! tag that stops forward walks. The word below the first block is the
//! prologue footer, which stops backward walks the same way.

use core::alloc::Layout;
use core::num::NonZeroU32;
use core::ptr::NonNull;

use crate::base::{BasePtr, FreeLinks};
use crate::polyfill::NonNullStrict;
use crate::sink::BrkSink;
use crate::word::{is_alloc, pack, unpacked_size, DSIZE, WSIZE};
use crate::AllocInitError;

/// Returns the offset of the tag word of the block whose payload is at `bp`.
#[inline]
pub(crate) fn hdr(bp: NonZeroU32) -> u32 {
    bp.get() - WSIZE
}

/// A sink plus the bookkeeping needed to address blocks inside it.
pub(crate) struct Heap<S> {
    base: BasePtr,
    brk: u32,
    sink: S,
}

impl<S: BrkSink> Heap<S> {
    /// Claims the first `prefix` bytes of the sink for the heap prefix
    /// (alignment padding, prologue, epilogue).
    ///
    /// The prefix words are left uninitialized; the caller lays them out.
    pub fn bootstrap(mut sink: S, prefix: u32) -> Result<Heap<S>, AllocInitError> {
        let layout = Layout::from_size_align(prefix as usize, DSIZE as usize).unwrap();
        let ptr = sink
            .extend(prefix as usize)
            .ok_or(AllocInitError::AllocFailed(layout))?;

        if ptr.addr().get() % DSIZE as usize != 0 {
            return Err(AllocInitError::InvalidLocation);
        }

        Ok(Heap {
            base: BasePtr::new(ptr),
            brk: prefix,
            sink,
        })
    }

    /// Returns the shared base pointer.
    #[inline]
    pub fn base(&self) -> BasePtr {
        self.base
    }

    /// Returns the current break as a byte offset from the base.
    #[inline]
    pub fn brk(&self) -> u32 {
        self.brk
    }

    /// Returns a shared reference to the sink.
    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Reads the tag word at offset `ofs`.
    #[inline]
    pub fn word(&self, ofs: u32) -> u32 {
        debug_assert!(ofs + WSIZE <= self.brk);

        // SAFETY: the offset lies below the break, within the region the
        // sink guarantees valid.
        unsafe { self.base.read_word(ofs) }
    }

    /// Writes the tag word at offset `ofs`.
    #[inline]
    pub fn put(&mut self, ofs: u32, word: u32) {
        debug_assert!(ofs + WSIZE <= self.brk);

        // SAFETY: as in `word`; `&mut self` keeps the write exclusive.
        unsafe { self.base.write_word(ofs, word) };
    }

    /// Returns the size of the block at `bp`.
    #[inline]
    pub fn block_size(&self, bp: NonZeroU32) -> u32 {
        unpacked_size(self.word(hdr(bp)))
    }

    /// Returns whether the block at `bp` is allocated.
    #[inline]
    pub fn block_alloc(&self, bp: NonZeroU32) -> bool {
        is_alloc(self.word(hdr(bp)))
    }

    /// Returns the footer offset of the block at `bp`.
    ///
    /// Only meaningful in variants that write footers.
    #[cfg(test)]
    #[inline]
    pub fn ftr(&self, bp: NonZeroU32) -> u32 {
        bp.get() + self.block_size(bp) - DSIZE
    }

    /// Returns the payload offset of the next block.
    ///
    /// Applied to the last block this lands on the epilogue, whose zero size
    /// and set allocated bit terminate forward walks.
    #[inline]
    pub fn next_bp(&self, bp: NonZeroU32) -> NonZeroU32 {
        NonZeroU32::new(bp.get() + self.block_size(bp)).unwrap()
    }

    /// Returns the payload offset of the previous block, read through its
    /// footer.
    ///
    /// Requires footers; the buddy variant never walks backward.
    #[inline]
    pub fn prev_bp(&self, bp: NonZeroU32) -> NonZeroU32 {
        NonZeroU32::new(bp.get() - unpacked_size(self.word(bp.get() - DSIZE))).unwrap()
    }

    /// Writes the header of the block at `bp`.
    #[inline]
    pub fn set_header(&mut self, bp: NonZeroU32, size: u32, alloc: bool) {
        self.put(hdr(bp), pack(size, alloc));
    }

    /// Writes matching header and footer for the block at `bp`.
    #[inline]
    pub fn set_boundary_tags(&mut self, bp: NonZeroU32, size: u32, alloc: bool) {
        self.put(hdr(bp), pack(size, alloc));
        self.put(bp.get() + size - DSIZE, pack(size, alloc));
    }

    /// Returns a pointer to the payload of the block at `bp`.
    #[inline]
    pub fn payload(&self, bp: NonZeroU32) -> NonNull<u8> {
        self.base.at(bp.get())
    }

    /// Returns the payload offset of the block behind `ptr`.
    #[inline]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> NonZeroU32 {
        let ofs = ptr.addr().get().checked_sub(self.base.addr().get()).unwrap();
        debug_assert!(ofs < self.brk as usize);
        debug_assert_eq!(ofs % DSIZE as usize, 0);

        NonZeroU32::new(u32::try_from(ofs).unwrap()).unwrap()
    }

    /// Reads the index links of the free block at `bp`.
    #[inline]
    pub fn links(&self, bp: NonZeroU32) -> FreeLinks {
        // SAFETY: callers only name free blocks, whose payloads hold
        // initialized links.
        unsafe { self.base.read_links(bp) }
    }

    /// Overwrites the index links of the free block at `bp`.
    #[inline]
    pub fn set_links(&mut self, bp: NonZeroU32, links: FreeLinks) {
        // SAFETY: callers only name free blocks; their payloads are dead
        // storage owned by the allocator.
        unsafe { self.base.write_links(bp, links) };
    }

    /// Grows the heap by `words` heap words (rounded up to even) and shapes
    /// the new bytes into one free block followed by a fresh epilogue.
    ///
    /// The old epilogue word is overwritten as the new block's header, so
    /// the returned `bp` is the old break. Returns `None` if the sink
    /// refuses to grow or the break would no longer fit a tag word.
    pub fn extend_block(&mut self, words: usize, with_footer: bool) -> Option<NonZeroU32> {
        let words = words.checked_add(words % 2)?;
        let bytes = words.checked_mul(WSIZE as usize)?;
        let size = u32::try_from(bytes).ok()?;
        let new_brk = self.brk.checked_add(size)?;

        let ptr = self.sink.extend(bytes)?;
        debug_assert_eq!(
            ptr.addr().get(),
            self.base.addr().get() + self.brk as usize,
            "sink extension is not contiguous"
        );

        let bp = NonZeroU32::new(self.brk).unwrap();
        self.brk = new_brk;

        self.set_header(bp, size, false);
        if with_footer {
            self.put(bp.get() + size - DSIZE, pack(size, false));
        }
        self.put(new_brk - WSIZE, pack(0, true));

        Some(bp)
    }
}
