#![cfg(feature = "unix")]

use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};

pub use nix::sys::mman::{MapFlags, ProtFlags};

use super::{Backend, PAGE_SIZE};
use crate::error::BackendError;

unsafe fn as_c_void(addr: usize) -> NonNull<c_void> {
    let ptr = addr as *mut c_void;
    unsafe { NonNull::new_unchecked(ptr) }
}

/// Private anonymous mappings.
///
/// Alignments above the page size are served by over-mapping and trimming
/// the unaligned head and tail.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapBackend;

impl MmapBackend {
    const PFLAGS: ProtFlags = ProtFlags::PROT_READ.union(ProtFlags::PROT_WRITE);
    const MFLAGS: MapFlags = MapFlags::MAP_PRIVATE;

    fn map_raw(size: usize) -> nix::Result<NonNull<c_void>> {
        use nix::sys::mman;

        let size = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        unsafe { mman::mmap_anonymous(None, size, Self::PFLAGS, Self::MFLAGS) }
    }

    unsafe fn unmap_raw(addr: usize, size: usize) -> nix::Result<()> {
        if size == 0 {
            return Ok(());
        }
        unsafe { nix::sys::mman::munmap(as_c_void(addr), size) }
    }
}

unsafe impl Backend for MmapBackend {
    fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, BackendError> {
        if !align.is_power_of_two() || !memory_addr::is_aligned(size, PAGE_SIZE) {
            return Err(BackendError::InvalidLayout { size, align });
        }
        if align <= PAGE_SIZE {
            return Ok(Self::map_raw(size)?.cast());
        }

        let span = size + align;
        let start = Self::map_raw(span)?.as_ptr() as usize;
        let aligned = memory_addr::align_up(start, align);
        unsafe {
            Self::unmap_raw(start, aligned - start)?;
            Self::unmap_raw(aligned + size, start + span - aligned - size)?;
            Ok(as_c_void(aligned).cast())
        }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, _align: usize) {
        let res = unsafe { Self::unmap_raw(ptr.as_ptr() as usize, size) };
        debug_assert!(res.is_ok(), "munmap failed: {:?}", res);
        #[cfg(feature = "tracing")]
        if let Err(err) = res {
            tracing::warn!("munmap of {:p} failed: {}", ptr, err);
        }
    }
}

#[cfg(test)]
mod tests {
    #![cfg(target_os = "linux")]

    use super::MmapBackend;
    use crate::os::Backend;

    #[test]
    fn aligned_segment() {
        const SIZE: usize = 128 * 1024;
        let bk = MmapBackend;
        let ptr = bk.map(SIZE, SIZE).expect("should map");
        assert!(memory_addr::is_aligned(ptr.as_ptr() as usize, SIZE));
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, SIZE);
            assert_eq!(*ptr.as_ptr().add(SIZE - 1), 0x5A);
            bk.unmap(ptr, SIZE, SIZE);
        }
    }

    #[test]
    fn unaligned_size() {
        assert!(MmapBackend.map(100, 4096).is_err());
        assert!(MmapBackend.map(0, 4096).is_err());
    }
}
