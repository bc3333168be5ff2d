use core::marker::PhantomData;
use core::ptr::NonNull;

use alloc::boxed::Box;

use crate::header::Anchor;
use crate::region::{ReclaimLock, RegionId};
use crate::shard::Shard;

/// State shared by the owning handles: the anchor compaction rewrites and
/// the shard the object lives on.
struct Handle {
    anchor: Box<Anchor>,
    shard: Shard,
}

/// Region lock held for the duration of a closure.
struct Locked<'a> {
    shard: &'a Shard,
    region: RegionId,
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        self.shard.unlock_region(self.region);
    }
}

/// Frees an object's slot once its destructor is done, even on unwind.
struct FreeOnDrop<'a> {
    shard: &'a Shard,
    payload: NonNull<u8>,
}

impl Drop for FreeOnDrop<'_> {
    fn drop(&mut self) {
        unsafe { self.shard.free_object(self.payload) };
    }
}

impl Handle {
    #[inline]
    fn payload(&self) -> NonNull<u8> {
        match self.anchor.get() {
            Some(ptr) => ptr,
            None => panic!("managed object outlived its region"),
        }
    }

    fn region(&self) -> Option<RegionId> {
        let payload = self.anchor.get()?;
        unsafe { self.shard.state_ref().owner_of(payload) }
    }

    fn lock(&self) -> Locked<'_> {
        let region = match self.region() {
            Some(region) => region,
            None => panic!("managed object outlived its region"),
        };
        self.shard.lock_region(region);
        Locked {
            shard: &self.shard,
            region,
        }
    }

    fn check_lock(&self, lock: &ReclaimLock<'_>) {
        assert!(
            lock.region().shard().ptr_eq(&self.shard) && self.region() == Some(lock.region().id()),
            "reclaim lock of a different region"
        );
    }

    /// Runs `dispose` on the payload with the region locked, then frees the
    /// slot.
    fn destroy(&mut self, dispose: impl FnOnce(NonNull<u8>)) {
        let Some(payload) = self.anchor.get() else {
            return;
        };
        let _free = FreeOnDrop {
            shard: &self.shard,
            payload,
        };
        let _lock = self.lock();
        dispose(payload);
        self.anchor.clear();
    }
}

/// Owning handle to a `T` stored in a region.
///
/// The value may be moved by compaction; the handle follows it. Dropping the
/// handle destroys the value. If the region is dropped first the value is
/// destroyed with it and the handle becomes dead.
pub struct Managed<T: 'static> {
    handle: Handle,
    _marker: PhantomData<T>,
}

impl<T: core::fmt::Debug + 'static> core::fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_live() {
            self.with(|value| core::fmt::Debug::fmt(value, f))
        } else {
            f.write_str("<dead>")
        }
    }
}

impl<T: 'static> Managed<T> {
    /// # Safety
    ///
    /// `anchor` must point at an initialised `T` allocated on `shard`.
    pub(crate) unsafe fn from_anchor(anchor: Box<Anchor>, shard: Shard) -> Self {
        Self {
            handle: Handle { anchor, shard },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.handle.anchor.get().is_some()
    }

    /// Region currently holding the value.
    pub fn region(&self) -> Option<RegionId> {
        self.handle.region()
    }

    /// Current address, valid until the region's reclaim counter advances.
    /// Null once the value is gone.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.handle
            .anchor
            .get()
            .map_or(core::ptr::null(), |ptr| ptr.as_ptr().cast_const().cast())
    }

    /// Borrows the value with its region locked for the closure's duration.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _lock = self.handle.lock();
        f(unsafe { self.handle.payload().cast::<T>().as_ref() })
    }

    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let _lock = self.handle.lock();
        f(unsafe { self.handle.payload().cast::<T>().as_mut() })
    }

    /// Borrows the value for as long as `lock` pins its region.
    pub fn get<'a>(&'a self, lock: &'a ReclaimLock<'_>) -> &'a T {
        self.handle.check_lock(lock);
        unsafe { self.handle.payload().cast::<T>().as_ref() }
    }

    pub fn get_mut<'a>(&'a mut self, lock: &'a ReclaimLock<'_>) -> &'a mut T {
        self.handle.check_lock(lock);
        unsafe { self.handle.payload().cast::<T>().as_mut() }
    }
}

impl<T: 'static> Drop for Managed<T> {
    fn drop(&mut self) {
        self.handle
            .destroy(|payload| unsafe { core::ptr::drop_in_place(payload.cast::<T>().as_ptr()) });
    }
}

/// Owning handle to a byte blob stored in a region.
pub struct ManagedBytes {
    handle: Handle,
    len: usize,
}

impl core::fmt::Debug for ManagedBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManagedBytes")
            .field("len", &self.len)
            .field("live", &self.is_live())
            .finish()
    }
}

impl ManagedBytes {
    /// # Safety
    ///
    /// `anchor` must point at `len` initialised bytes allocated on `shard`.
    pub(crate) unsafe fn from_anchor(anchor: Box<Anchor>, len: usize, shard: Shard) -> Self {
        Self {
            handle: Handle { anchor, shard },
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.handle.anchor.get().is_some()
    }

    pub fn region(&self) -> Option<RegionId> {
        self.handle.region()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.handle
            .anchor
            .get()
            .map_or(core::ptr::null(), |ptr| ptr.as_ptr().cast_const())
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _lock = self.handle.lock();
        let ptr = self.handle.payload();
        f(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.len) })
    }

    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let _lock = self.handle.lock();
        let ptr = self.handle.payload();
        f(unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) })
    }

    pub fn get<'a>(&'a self, lock: &'a ReclaimLock<'_>) -> &'a [u8] {
        self.handle.check_lock(lock);
        let ptr = self.handle.payload();
        unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.len) }
    }
}

impl Drop for ManagedBytes {
    fn drop(&mut self) {
        self.handle.destroy(|_| {});
    }
}
