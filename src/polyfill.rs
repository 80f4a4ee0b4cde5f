//! Stable stand-ins for the strict-provenance pointer APIs.
//!
//! All heap bookkeeping in this crate is done with plain addresses; actual
//! pointers are minted from the base pointer of the managed region. On
//! stable toolchains the address/pointer conversions come from the [`sptr`]
//! crate rather than the unstable `strict_provenance` feature.

use core::{num::NonZeroUsize, ptr::NonNull};

pub(crate) use sptr::Strict;

/// `NonNull` counterparts of the `sptr` address methods.
pub(crate) trait NonNullStrict<T> {
    /// Returns the address of the pointer.
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    /// Creates a new pointer with the given address and the provenance of
    /// `self`.
    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    #[inline]
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is non-null, so its address is non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    #[inline]
    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: `addr` is non-zero, so the result of `with_addr` is
        // non-null.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
    }
}
