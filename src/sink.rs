//! The brk-style memory sink consumed by the allocators.
//!
//! A sink hands out a single contiguous region that only ever grows, in the
//! manner of `sbrk(2)`. The allocators own the interpretation of every byte
//! between [`heap_lo`] and [`heap_hi`]; the sink owns the mapping itself and
//! is never asked to release memory.
//!
//! [`heap_lo`]: BrkSink::heap_lo
//! [`heap_hi`]: BrkSink::heap_hi

use core::num::NonZeroUsize;
use core::ptr::NonNull;

#[cfg(any(feature = "alloc", test))]
use core::alloc::Layout;

use crate::polyfill::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::AllocInitError;

/// Types which provide monotonically growing memory to back an allocator.
///
/// # Safety
///
/// Implementations must uphold the following invariants, which the
/// allocators rely on for memory safety:
///
/// - A successful `extend(len)` returns a pointer that is valid for reads
///   and writes for `len` bytes, and the memory stays valid (at a stable
///   address) for the lifetime of the sink.
/// - The extended bytes are initialized (any fixed pattern will do). The
///   allocators probe heap words that user code may never have written.
/// - Extensions are contiguous: each successful `extend` returns the
///   address `heap_lo() + heap_size()` as observed before the call.
/// - The entire region from `heap_lo()` upward belongs to a single
///   allocated object, so that pointers derived from `heap_lo()` by offset
///   may access all of it.
pub unsafe trait BrkSink {
    /// Appends `len` bytes to the managed region.
    ///
    /// Returns the address where the new bytes begin, or `None` if the sink
    /// cannot grow any further.
    fn extend(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the first address of the managed region.
    fn heap_lo(&self) -> NonNull<u8>;

    /// Returns one past the last currently extended address.
    fn heap_hi(&self) -> NonNull<u8>;

    /// Returns the number of bytes extended so far.
    fn heap_size(&self) -> usize;
}

/// A sink over a caller-provided region of memory.
///
/// The break starts at the bottom of the region and bumps upward; once the
/// capacity is exhausted every further [`extend`](BrkSink::extend) fails.
#[derive(Debug)]
pub struct FixedBrk {
    region: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl FixedBrk {
    /// Constructs a new `FixedBrk` over `capacity` bytes at `region`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `capacity` bytes
    ///   for as long as the sink (and any allocator built over it) is alive.
    /// - `region` must be 8-aligned and its bytes initialized.
    /// - The memory must not be accessed except through the sink's consumer
    ///   while the sink is alive.
    pub unsafe fn new(region: NonNull<u8>, capacity: usize) -> FixedBrk {
        debug_assert_eq!(region.addr().get() % 8, 0);

        FixedBrk {
            region,
            capacity,
            brk: 0,
        }
    }

    /// Returns the total capacity of the region, in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// SAFETY: the constructor contract makes the whole region one valid object;
// `extend` bumps the break within it, so extensions are contiguous.
unsafe impl BrkSink for FixedBrk {
    fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        let new_brk = self.brk.checked_add(len)?;
        if new_brk > self.capacity {
            return None;
        }

        let old = offset_ptr(self.region, self.brk);
        self.brk = new_brk;
        Some(old)
    }

    #[inline]
    fn heap_lo(&self) -> NonNull<u8> {
        self.region
    }

    #[inline]
    fn heap_hi(&self) -> NonNull<u8> {
        offset_ptr(self.region, self.brk)
    }

    #[inline]
    fn heap_size(&self) -> usize {
        self.brk
    }
}

/// A sink whose region is reserved from the global allocator.
///
/// The full capacity is allocated up front at construction and released when
/// the sink is dropped; [`extend`](BrkSink::extend) merely advances the
/// break within it.
#[cfg(any(feature = "alloc", test))]
#[derive(Debug)]
pub struct GlobalBrk {
    region: NonNull<u8>,
    layout: Layout,
    brk: usize,
}

#[cfg(any(feature = "alloc", test))]
impl GlobalBrk {
    /// Reserves `capacity` bytes from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero or the global allocator cannot
    /// satisfy the reservation.
    pub fn with_capacity(capacity: usize) -> Result<GlobalBrk, AllocInitError> {
        let layout = Layout::from_size_align(capacity, 8).map_err(|_| AllocInitError::InvalidConfig)?;
        if capacity == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        // SAFETY: `layout` has non-zero size. Zeroed so that every heap
        // word reads as initialized memory.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let region = NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?;

        Ok(GlobalBrk {
            region,
            layout,
            brk: 0,
        })
    }

    /// Returns the total capacity of the reservation, in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }
}

#[cfg(any(feature = "alloc", test))]
impl Drop for GlobalBrk {
    fn drop(&mut self) {
        // SAFETY: `region` was allocated with `layout` in `with_capacity`.
        unsafe { alloc::alloc::dealloc(self.region.as_ptr(), self.layout) };
    }
}

// SAFETY: the reservation is a single global-allocator object that lives
// until drop; `extend` bumps the break within it.
#[cfg(any(feature = "alloc", test))]
unsafe impl BrkSink for GlobalBrk {
    fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        let new_brk = self.brk.checked_add(len)?;
        if new_brk > self.layout.size() {
            return None;
        }

        let old = offset_ptr(self.region, self.brk);
        self.brk = new_brk;
        Some(old)
    }

    #[inline]
    fn heap_lo(&self) -> NonNull<u8> {
        self.region
    }

    #[inline]
    fn heap_hi(&self) -> NonNull<u8> {
        offset_ptr(self.region, self.brk)
    }

    #[inline]
    fn heap_size(&self) -> usize {
        self.brk
    }
}

#[inline]
fn offset_ptr(base: NonNull<u8>, ofs: usize) -> NonNull<u8> {
    let raw = base.addr().get().checked_add(ofs).unwrap();

    // SAFETY: the base address is non-zero and the sum did not overflow.
    let addr = unsafe { NonZeroUsize::new_unchecked(raw) };

    base.with_addr(addr)
}
