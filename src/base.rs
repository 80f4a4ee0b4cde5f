use core::{
    mem,
    num::{NonZeroU32, NonZeroUsize},
    ptr::NonNull,
};

use crate::polyfill::NonNullStrict;
use crate::word::WSIZE;

/// A pointer to the base of the heap region managed by an allocator.
///
/// Blocks are identified throughout the crate by their byte offset from this
/// base; every actual pointer into the heap is created here, so all heap
/// accesses share the provenance of the original region pointer.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BasePtr {
    ptr: NonNull<u8>,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>) -> BasePtr {
        BasePtr { ptr }
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns a pointer `ofs` bytes above the base.
    ///
    /// The returned pointer has the provenance of the base pointer.
    #[inline]
    pub fn at(self, ofs: u32) -> NonNull<u8> {
        let raw = self.ptr.addr().get().checked_add(ofs as usize).unwrap();

        // SAFETY: the base address is non-zero and the sum did not overflow.
        let addr = unsafe { NonZeroUsize::new_unchecked(raw) };

        self.ptr.with_addr(addr)
    }

    /// Reads the tag word at `ofs` bytes above the base.
    ///
    /// # Safety
    ///
    /// `ofs` must be 4-aligned and lie within the extended heap region.
    #[inline]
    pub unsafe fn read_word(self, ofs: u32) -> u32 {
        debug_assert_eq!(ofs % WSIZE, 0);

        unsafe { self.at(ofs).cast::<u32>().as_ptr().read() }
    }

    /// Writes the tag word at `ofs` bytes above the base.
    ///
    /// # Safety
    ///
    /// `ofs` must be 4-aligned and lie within the extended heap region, and
    /// the word must not be part of a live allocation's payload.
    #[inline]
    pub unsafe fn write_word(self, ofs: u32, value: u32) {
        debug_assert_eq!(ofs % WSIZE, 0);

        unsafe { self.at(ofs).cast::<u32>().as_ptr().write(value) };
    }

    /// Reads the `FreeLinks` stored in the payload at offset `bp`.
    ///
    /// # Safety
    ///
    /// The block at `bp` must be free and its payload must contain
    /// initialized `FreeLinks`.
    #[inline]
    pub unsafe fn read_links(self, bp: NonZeroU32) -> FreeLinks {
        unsafe { self.at(bp.get()).cast::<FreeLinks>().as_ptr().read() }
    }

    /// Writes `links` into the payload at offset `bp`.
    ///
    /// # Safety
    ///
    /// The block at `bp` must be free: its payload is dead storage owned by
    /// the allocator.
    #[inline]
    pub unsafe fn write_links(self, bp: NonZeroU32, links: FreeLinks) {
        unsafe { self.at(bp.get()).cast::<FreeLinks>().as_ptr().write(links) };
    }

    /// Returns a mutable reference to the `FreeLinks` at offset `bp`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The block at `bp` must be free and its payload must contain
    ///   initialized `FreeLinks`.
    /// - No other reference to these links may exist for `'a`.
    #[inline]
    pub unsafe fn links_mut<'a>(self, bp: NonZeroU32) -> &'a mut FreeLinks {
        unsafe { self.at(bp.get()).cast::<FreeLinks>().as_mut() }
    }
}

// Link words hold block offsets rather than pointers or raw addresses. The
// links "point to" other free blocks, but by forgoing actual pointers no
// borrow is implied, and any real pointer to a block must be minted from the
// base pointer. Offsets also fit a heap word each, which is what lets the
// pair live in the 8-byte payload of a minimum-size free block.

/// The index links threaded through the payload of every free block.
///
/// `None` marks the end of a list; no block payload can sit at offset zero,
/// which is the alignment padding word.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FreeLinks {
    pub pred: Option<NonZeroU32>,
    pub succ: Option<NonZeroU32>,
}

const _: () = assert!(mem::size_of::<FreeLinks>() == 2 * WSIZE as usize);
const _: () = assert!(mem::align_of::<FreeLinks>() == WSIZE as usize);
