//! Native buffer primitives for Stagecoach
//!
//! This module is the ONLY place (besides the slot storage in `pool`) where
//! unsafe memory manipulation is allowed. All invariants are enforced here so
//! the rest of the system can remain safe.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{Result, StageError};

/// Alignment of every native buffer handed out by [`HeapAlloc`].
pub const BUF_ALIGN: usize = 8;

/// An exclusively owned block of native memory.
///
/// Invariant:
/// - Exactly one holder (a pool slot, a page chain, or a caller) owns the
///   block at any time; it is never aliased.
/// - There is no implicit finalization: the holder must return the block to
///   a pool or hand it back to its [`NativeAlloc`] exactly once.
#[derive(Debug)]
pub struct NativeBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a NativeBuf is an exclusively owned block; moving it between
// threads moves ownership with it, and shared references only permit reads.
unsafe impl Send for NativeBuf {}
unsafe impl Sync for NativeBuf {}

impl NativeBuf {
    /// Wrap a raw block.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable and writable bytes that no other
    /// live `NativeBuf` refers to, valid until the block is freed.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length of the block in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// A zero-length block cannot be constructed, but the standard pair is
    /// kept for API symmetry.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw base address, for scatter/gather descriptors and identity checks.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the whole block as a byte slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe one exclusively owned live allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the whole block as a mutable byte slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `&mut self` guarantees exclusive access to the block.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Split into raw parts, giving the allocator back what it handed out.
    pub(crate) fn into_raw(self) -> (NonNull<u8>, usize) {
        (self.ptr, self.len)
    }
}

/// The allocation seam between the staging layer and the native library.
///
/// Implementations hand out blocks of exactly the requested size and free
/// blocks they previously handed out. The staging layer guarantees every
/// block reaches `free` at most once.
pub trait NativeAlloc: Send + Sync {
    /// Allocate a block of exactly `size` bytes.
    fn alloc(&self, size: usize) -> Result<NativeBuf>;

    /// Release a block previously produced by this allocator.
    fn free(&self, buf: NativeBuf);
}

/// Process-heap allocator.
///
/// Stands in for the native library's message allocator wherever no real
/// transport is wired up: tests, benches, and the in-memory transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAlloc;

impl NativeAlloc for HeapAlloc {
    fn alloc(&self, size: usize) -> Result<NativeBuf> {
        if size == 0 {
            return Err(StageError::invalid_argument("size", "must be positive"));
        }

        let layout = Layout::from_size_align(size, BUF_ALIGN)
            .map_err(|_| StageError::AllocFailed { size })?;

        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(StageError::AllocFailed { size });
        };

        // SAFETY: freshly allocated block of `size` bytes, not aliased.
        Ok(unsafe { NativeBuf::from_raw(ptr, size) })
    }

    fn free(&self, buf: NativeBuf) {
        let (ptr, len) = buf.into_raw();
        // SAFETY: the block was produced by `alloc` with this exact layout,
        // and ownership of NativeBuf guarantees it has not been freed yet.
        unsafe {
            let layout = Layout::from_size_align_unchecked(len, BUF_ALIGN);
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_hands_out_exact_size() {
        let heap = HeapAlloc;
        let mut buf = heap.alloc(100).unwrap();
        assert_eq!(buf.len(), 100);
        buf.as_mut_slice().fill(0xAB);
        assert!(buf.as_slice().iter().all(|&b| b == 0xAB));
        heap.free(buf);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(HeapAlloc.alloc(0).is_err());
    }
}
