//! [`heap_hater::Subject`] adapters for the `brk_alloc` allocators.
//!
//! Each subject owns an allocator over a [`GlobalBrk`] sink of a fixed
//! capacity, so evaluation runs bump into heap exhaustion (reported as
//! failed allocations) rather than growing without bound.

#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use brk_alloc::{AllocError, AllocInitError, Buddy, ExplicitList, GlobalBrk, Placement, SegFit};
use heap_hater::Subject;

/// A [`Subject`] over the explicit-list allocator.
pub struct ExplicitSubject(ExplicitList<GlobalBrk>);

impl ExplicitSubject {
    /// Builds the subject over a fresh sink of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
        let sink = GlobalBrk::with_capacity(capacity)?;
        Ok(ExplicitSubject(ExplicitList::try_new(sink)?))
    }

    /// As [`ExplicitSubject::new`], with an explicit placement policy.
    pub fn with_placement(capacity: usize, placement: Placement) -> Result<Self, AllocInitError> {
        let sink = GlobalBrk::with_capacity(capacity)?;
        Ok(ExplicitSubject(ExplicitList::try_new_with_placement(
            sink, placement,
        )?))
    }
}

impl Subject for ExplicitSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.allocate(size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.free(ptr) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        unsafe { self.0.reallocate(ptr, size) }
    }
}

/// A [`Subject`] over the segregated-fit allocator.
pub struct SegFitSubject(SegFit<GlobalBrk>);

impl SegFitSubject {
    /// Builds the subject over a fresh sink of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
        let sink = GlobalBrk::with_capacity(capacity)?;
        Ok(SegFitSubject(SegFit::try_new(sink)?))
    }
}

impl Subject for SegFitSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.allocate(size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.free(ptr) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        unsafe { self.0.reallocate(ptr, size) }
    }
}

/// A [`Subject`] over the binary-buddy allocator.
pub struct BuddySubject(Buddy<GlobalBrk>);

impl BuddySubject {
    /// Builds the subject over a fresh sink of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
        let sink = GlobalBrk::with_capacity(capacity)?;
        Ok(BuddySubject(Buddy::try_new(sink)?))
    }
}

impl Subject for BuddySubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.allocate(size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.free(ptr) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        unsafe { self.0.reallocate(ptr, size) }
    }
}
