use core::cell::Cell;
use core::ptr::{self, NonNull};

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u16 {
        const LIVE  = 0x1;
        /// Lives in a standalone non-LSA segment and never moves.
        const LARGE = 0x1 << 1;
    }
}

/// Out-of-line slot a handle reads its object's address from.
///
/// Compaction rewrites it; a null pointer means the object is gone.
#[derive(Debug)]
pub(crate) struct Anchor {
    ptr: Cell<*mut u8>,
}

impl Anchor {
    pub const fn dead() -> Self {
        Self {
            ptr: Cell::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.ptr.get())
    }

    #[inline]
    pub fn set(&self, ptr: NonNull<u8>) {
        self.ptr.set(ptr.as_ptr());
    }

    #[inline]
    pub fn clear(&self) {
        self.ptr.set(ptr::null_mut());
    }
}

pub(crate) const HEADER_SIZE: usize = size_of::<ObjectHeader>();
pub(crate) const OBJECT_ALIGN: usize = align_of::<ObjectHeader>();
/// Smallest gap a filler header can cover.
pub(crate) const MIN_FILLER: usize = slot_size(1);

/// Prepended to every object; the payload follows immediately.
#[repr(C, align(8))]
#[derive(Debug)]
pub(crate) struct ObjectHeader {
    size: u32,
    migrator: u16,
    flags: ObjectFlags,
    anchor: *const Anchor,
    #[cfg(target_pointer_width = "32")]
    _pad: u32,
}

const _: () = assert!(HEADER_SIZE == 16);

impl ObjectHeader {
    #[inline]
    pub const fn new(size: u32, migrator: u16, flags: ObjectFlags, anchor: *const Anchor) -> Self {
        Self {
            size,
            migrator,
            flags: flags.union(ObjectFlags::LIVE),
            anchor,
            #[cfg(target_pointer_width = "32")]
            _pad: 0,
        }
    }

    /// A dead header covering `len` bytes of alignment padding.
    #[inline]
    pub const fn filler(len: usize) -> Self {
        debug_assert!(len >= MIN_FILLER && len % OBJECT_ALIGN == 0);
        Self {
            size: (len - HEADER_SIZE) as u32,
            migrator: 0,
            flags: ObjectFlags::empty(),
            anchor: ptr::null(),
            #[cfg(target_pointer_width = "32")]
            _pad: 0,
        }
    }

    /// Header of the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must point at a payload written by the allocator.
    #[inline]
    pub unsafe fn of<'a>(payload: NonNull<u8>) -> &'a mut ObjectHeader {
        unsafe { &mut *payload.as_ptr().sub(HEADER_SIZE).cast::<ObjectHeader>() }
    }

    /// # Safety
    ///
    /// `at` must point at a header written by the allocator.
    #[inline]
    pub unsafe fn at<'a>(at: *mut u8) -> &'a mut ObjectHeader {
        unsafe { &mut *at.cast::<ObjectHeader>() }
    }

    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        let ptr = (self as *const Self).cast_mut().cast::<u8>();
        unsafe { NonNull::new_unchecked(ptr.add(HEADER_SIZE)) }
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub const fn migrator(&self) -> u16 {
        self.migrator
    }

    #[inline]
    pub const fn is_live(&self) -> bool {
        self.flags.contains(ObjectFlags::LIVE)
    }

    #[inline]
    pub const fn is_large(&self) -> bool {
        self.flags.contains(ObjectFlags::LARGE)
    }

    #[inline]
    pub fn kill(&mut self) {
        debug_assert!(self.is_live(), "object destroyed twice");
        self.flags.remove(ObjectFlags::LIVE);
    }

    #[inline]
    pub fn anchor(&self) -> Option<&Anchor> {
        unsafe { self.anchor.as_ref() }
    }

    /// Bytes the object occupies in its segment, header included.
    #[inline]
    pub const fn slot_size(&self) -> usize {
        slot_size(self.size as usize)
    }
}

/// Empty payloads still take a word so their address stays inside the
/// segment.
#[inline]
pub(crate) const fn slot_size(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    HEADER_SIZE + memory_addr::align_up(size, OBJECT_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::{Anchor, HEADER_SIZE, ObjectFlags, ObjectHeader, slot_size};
    use core::ptr::NonNull;

    #[test]
    fn slot_sizes() {
        assert_eq!(slot_size(0), HEADER_SIZE + 8);
        assert_eq!(slot_size(4), 24);
        assert_eq!(slot_size(8), 24);
        assert_eq!(slot_size(9), 32);
    }

    #[test]
    fn filler_spans_its_gap() {
        for len in [24, 40, 64, 96] {
            let filler = ObjectHeader::filler(len);
            assert!(!filler.is_live());
            assert!(filler.anchor().is_none());
            assert_eq!(filler.slot_size(), len);
        }
    }

    #[test]
    fn header_round_trip() {
        let anchor = Anchor::dead();
        let mut buf = [0u64; 4];
        let base = buf.as_mut_ptr().cast::<u8>();
        unsafe {
            base.cast::<ObjectHeader>()
                .write(ObjectHeader::new(8, 3, ObjectFlags::empty(), &anchor));
            let payload = NonNull::new_unchecked(base.add(HEADER_SIZE));
            let header = ObjectHeader::of(payload);
            assert!(header.is_live());
            assert!(!header.is_large());
            assert_eq!(header.migrator(), 3);
            assert_eq!(header.payload(), payload);

            header.anchor().expect("anchor").set(payload);
            assert_eq!(anchor.get(), Some(payload));

            header.kill();
            assert!(!header.is_live());
        }
    }
}
