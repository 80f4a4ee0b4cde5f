#![doc = include_str!("../README.md")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
// The `sptr` traits shadow the strict-provenance methods that newer
// toolchains provide natively.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod heap;
mod polyfill;
mod word;

pub mod buddy;
pub mod explicit;
pub mod segfit;
pub mod sink;

#[cfg(test)]
mod tests;

use core::alloc::Layout;
use core::fmt;

#[doc(inline)]
pub use crate::{buddy::Buddy, explicit::ExplicitList, segfit::SegFit};

pub use crate::sink::{BrkSink, FixedBrk};

#[cfg(any(feature = "alloc", test))]
pub use crate::sink::GlobalBrk;

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// The sink refused to supply the initial heap.
    ///
    /// The variant contains the [`Layout`] of the request that failed.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    InvalidConfig,

    /// The location of the heap is invalid.
    ///
    /// This variant is returned when the sink's region does not satisfy the
    /// heap's 8-byte alignment requirement.
    InvalidLocation,
}

/// Indicates an allocation failure due to heap exhaustion or an unsupported
/// request.
///
/// This is the library's rendering of a null return from `malloc`: the sink
/// refused to extend the heap, the request was zero bytes, or the adjusted
/// block size does not fit a tag word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

/// The rule for choosing among free blocks that fit a request.
///
/// Used by [`ExplicitList`] over its single list and by [`SegFit`] within
/// each size class; the buddy allocator's fits are always exact.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Placement {
    /// Take the first fitting block encountered.
    FirstFit,

    /// Take the smallest fitting block; earlier blocks win ties.
    #[default]
    BestFit,

    /// Take the largest fitting block; earlier blocks win ties.
    WorstFit,
}
