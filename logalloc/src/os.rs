//! Host memory backends the segment pool maps segments from.

#[cfg(feature = "unix")]
pub mod unix;

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::BackendError;

pub const PAGE_SIZE: usize = 4096;

/// The host memory subsystem.
///
/// # Safety
///
/// `map` must return memory valid for reads and writes of `size` bytes and
/// aligned to `align`. The memory stays valid until passed back to `unmap`
/// with the same `size` and `align`.
pub unsafe trait Backend {
    fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, BackendError>;

    /// # Safety
    ///
    /// `ptr` must come from `map` on this backend with the same `size` and
    /// `align`, and must not be used afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

unsafe impl<B: Backend + ?Sized> Backend for alloc::boxed::Box<B> {
    #[inline]
    fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, BackendError> {
        (**self).map(size, align)
    }

    #[inline]
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        unsafe { (**self).unmap(ptr, size, align) }
    }
}

/// Segments taken from the global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBackend;

unsafe impl Backend for HeapBackend {
    fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, BackendError> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| BackendError::InvalidLayout { size, align })?;
        if layout.size() == 0 {
            return Err(BackendError::InvalidLayout { size, align });
        }
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(BackendError::Exhausted { size })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(feature = "unix")]
pub type DefaultBackend = unix::MmapBackend;
#[cfg(not(feature = "unix"))]
pub type DefaultBackend = HeapBackend;
