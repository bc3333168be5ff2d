use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::vec::Vec;
use bytesize::ByteSize;
use slab::Slab;

use crate::config::ShardConfig;
use crate::error::{Error, Result};
use crate::header::{HEADER_SIZE, MIN_FILLER, ObjectHeader};
use crate::os::{Backend, PAGE_SIZE};
use crate::region::RegionId;
use crate::stats::Stats;

pub(crate) type SegmentId = usize;

const SEGMENT_MAGIC: u32 = 0x15A0_5E61;

/// Written at the base of every segment so an object address can be
/// traced back to its descriptor.
#[repr(C, align(16))]
struct SegmentHeader {
    magic: u32,
    descriptor: u32,
    generation: u64,
}

pub(crate) const SEGMENT_HEADER_SIZE: usize = size_of::<SegmentHeader>();

const _: () = assert!(SEGMENT_HEADER_SIZE == 16);

#[derive(Debug)]
pub(crate) struct SegmentDescriptor {
    base: NonNull<u8>,
    len: usize,
    /// Bump offset from `base`.
    tail: usize,
    /// Bytes of live slots, headers included.
    occupancy: usize,
    region: Option<RegionId>,
    non_lsa: bool,
    generation: u64,
    /// Header offset of the single object of a non-LSA segment.
    large_at: usize,
}

impl SegmentDescriptor {
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Holes plus untouched tail.
    #[inline]
    pub const fn free_space(&self) -> usize {
        self.len - SEGMENT_HEADER_SIZE - self.occupancy
    }

    #[inline]
    pub const fn tail_space(&self) -> usize {
        self.len - self.tail
    }

    /// Bytes of destroyed objects below the bump pointer.
    #[inline]
    pub const fn dead_space(&self) -> usize {
        self.tail - SEGMENT_HEADER_SIZE - self.occupancy
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    #[inline]
    pub const fn is_non_lsa(&self) -> bool {
        self.non_lsa
    }

    #[inline]
    pub const fn region(&self) -> Option<RegionId> {
        self.region
    }

    #[inline]
    pub fn set_region(&mut self, region: RegionId) {
        self.region = Some(region);
    }

    /// Reserves `slot` bytes at the tail and returns their address. The
    /// payload behind the returned header is aligned to `align`; the gap in
    /// front is covered by a dead filler, counted as dead space.
    pub fn bump_aligned(&mut self, slot: usize, align: usize) -> Option<NonNull<u8>> {
        let pad = Self::padding(self.tail, align);
        if self.tail_space() < pad + slot {
            return None;
        }
        if pad > 0 {
            unsafe {
                self.base
                    .add(self.tail)
                    .cast::<ObjectHeader>()
                    .write(ObjectHeader::filler(pad))
            };
            self.tail += pad;
        }
        let at = unsafe { self.base.add(self.tail) };
        self.tail += slot;
        self.occupancy += slot;
        Some(at)
    }

    /// Filler bytes needed at `tail` so the next payload is aligned.
    #[inline]
    const fn padding(tail: usize, align: usize) -> usize {
        let payload = tail + HEADER_SIZE;
        let pad = memory_addr::align_up(payload, align) - payload;
        if pad == 0 || pad >= MIN_FILLER {
            pad
        } else {
            // too short for a header, skip one more alignment step
            pad + align
        }
    }

    /// Reserves the single object slot of a non-LSA segment and returns
    /// the payload address.
    #[inline]
    pub fn place_large(&mut self, offset: usize, slot: usize) -> NonNull<u8> {
        debug_assert!(self.non_lsa && self.tail == SEGMENT_HEADER_SIZE);
        self.large_at = offset - HEADER_SIZE;
        self.tail = self.len;
        self.occupancy = slot;
        unsafe { self.base.add(offset) }
    }

    /// Forgets every slot; used when a region is torn down wholesale.
    #[inline]
    pub fn clear(&mut self) {
        self.occupancy = 0;
    }

    #[inline]
    pub fn release_slot(&mut self, slot: usize) {
        debug_assert!(self.occupancy >= slot);
        self.occupancy -= slot;
    }

    /// Headers of every slot below the bump pointer, live or dead.
    pub fn slots(&self) -> Slots {
        if self.non_lsa {
            let at = unsafe { self.base.add(self.large_at) };
            return Slots {
                at,
                end: unsafe { at.add(usize::from(self.large_at != 0)) },
            };
        }
        Slots {
            at: unsafe { self.base.add(SEGMENT_HEADER_SIZE) },
            end: unsafe { self.base.add(self.tail) },
        }
    }
}

pub(crate) struct Slots {
    at: NonNull<u8>,
    end: NonNull<u8>,
}

impl Iterator for Slots {
    type Item = NonNull<ObjectHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.at >= self.end {
            return None;
        }
        let header = unsafe { ObjectHeader::at(self.at.as_ptr()) };
        let slot = header.slot_size();
        let current = self.at.cast();
        self.at = unsafe { self.at.add(slot) };
        Some(current)
    }
}

/// Shard-wide owner of segments.
///
/// Idle segments are cached up to `cache_limit` and handed to the next
/// region that needs one; the rest go back to the backend.
pub(crate) struct SegmentPool {
    backend: Box<dyn Backend>,
    descriptors: Slab<SegmentDescriptor>,
    free: Vec<NonNull<u8>>,
    segment_size: usize,
    cache_limit: usize,
    memory_limit: usize,
    allocation_limit: usize,
    mapped: usize,
    generation: u64,
    /// Set while the tracker reclaims; freed segments skip the cache.
    draining: bool,
    pub(crate) stats: Stats,
}

impl core::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("segments", &self.descriptors.len())
            .field("free", &self.free.len())
            .field("mapped", &ByteSize::b(self.mapped as u64))
            .finish()
    }
}

impl SegmentPool {
    pub fn new(config: &ShardConfig, backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            descriptors: Slab::new(),
            free: Vec::new(),
            segment_size: config.segment_size(),
            cache_limit: config.free_segment_cache(),
            memory_limit: config.memory_limit(),
            allocation_limit: config.allocation_limit(),
            mapped: 0,
            generation: 0,
            draining: false,
            stats: Stats::default(),
        }
    }

    #[inline]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Bytes currently held from the backend, idle segments included.
    #[inline]
    pub const fn mapped(&self) -> usize {
        self.mapped
    }

    #[inline]
    pub fn free_segments(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn set_draining(&mut self, draining: bool) -> bool {
        core::mem::replace(&mut self.draining, draining)
    }

    #[inline]
    pub fn get(&self, id: SegmentId) -> &SegmentDescriptor {
        &self.descriptors[id]
    }

    #[inline]
    pub fn get_mut(&mut self, id: SegmentId) -> &mut SegmentDescriptor {
        &mut self.descriptors[id]
    }

    /// Bytes an ordinary allocation may still map.
    pub fn available(&self) -> usize {
        let cached = self.free.len() * self.segment_size;
        self.allocation_limit.saturating_sub(self.mapped) + cached
    }

    fn limit(&self, reserve: bool) -> usize {
        if reserve {
            self.memory_limit
        } else {
            self.allocation_limit
        }
    }

    fn map(&mut self, len: usize, reserve: bool) -> Result<NonNull<u8>> {
        if self.mapped + len > self.limit(reserve) {
            return Err(Error::OutOfMemory {
                requested: len,
                available: self.limit(reserve).saturating_sub(self.mapped),
            });
        }
        let base = self.backend.map(len, self.segment_size)?;
        self.mapped += len;
        Ok(base)
    }

    fn unmap(&mut self, base: NonNull<u8>, len: usize) {
        unsafe { self.backend.unmap(base, len, self.segment_size) };
        self.mapped -= len;
    }

    fn register(
        &mut self,
        base: NonNull<u8>,
        len: usize,
        region: RegionId,
        non_lsa: bool,
    ) -> SegmentId {
        self.generation += 1;
        let generation = self.generation;
        let id = self.descriptors.insert(SegmentDescriptor {
            base,
            len,
            tail: SEGMENT_HEADER_SIZE,
            occupancy: 0,
            region: Some(region),
            non_lsa,
            generation,
            large_at: 0,
        });
        unsafe {
            base.cast::<SegmentHeader>().write(SegmentHeader {
                magic: SEGMENT_MAGIC,
                descriptor: id as u32,
                generation,
            })
        };
        id
    }

    /// Hands a segment to `region`, from the cache or freshly mapped.
    ///
    /// `reserve` lets compaction dip into the emergency reserve.
    pub fn acquire(&mut self, region: RegionId, reserve: bool) -> Result<SegmentId> {
        let base = match self.free.pop() {
            Some(base) => base,
            None => {
                let base = self.map(self.segment_size, reserve)?;
                self.stats.add_segments_mapped(1);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "mapped segment {:p}, {} held",
                    base,
                    ByteSize::b(self.mapped as u64)
                );
                base
            }
        };
        Ok(self.register(base, self.segment_size, region, false))
    }

    /// Maps a standalone segment large enough for an object whose payload
    /// sits `offset` bytes past the base.
    pub fn acquire_large(
        &mut self,
        region: RegionId,
        offset: usize,
        size: usize,
    ) -> Result<SegmentId> {
        let len = memory_addr::align_up(offset + size, PAGE_SIZE);
        let base = self.map(len, false)?;
        self.stats.add_large_mapped(1);
        #[cfg(feature = "tracing")]
        tracing::debug!("mapped standalone {} at {:p}", ByteSize::b(len as u64), base);
        Ok(self.register(base, len, region, true))
    }

    pub fn release(&mut self, id: SegmentId) {
        let desc = self.descriptors.remove(id);
        debug_assert!(desc.is_empty(), "released segment still holds objects");
        if desc.non_lsa {
            self.unmap(desc.base, desc.len);
            self.stats.add_large_unmapped(1);
        } else if !self.draining && self.free.len() < self.cache_limit {
            self.free.push(desc.base);
        } else {
            self.unmap(desc.base, desc.len);
            self.stats.add_segments_unmapped(1);
        }
    }

    /// Returns every idle segment to the backend.
    pub fn release_free(&mut self) -> usize {
        let count = self.free.len();
        while let Some(base) = self.free.pop() {
            self.unmap(base, self.segment_size);
        }
        self.stats.add_segments_unmapped(count);
        count * self.segment_size
    }

    /// Descriptor of the segment holding `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must lie within the first `segment_size` bytes of a segment
    /// handed out by this pool.
    pub unsafe fn lookup(&self, ptr: NonNull<u8>) -> SegmentId {
        let base = memory_addr::align_down(ptr.as_ptr() as usize, self.segment_size);
        let header = unsafe { &*(base as *const SegmentHeader) };
        debug_assert_eq!(header.magic, SEGMENT_MAGIC, "pointer outside any segment");
        let id = header.descriptor as SegmentId;
        debug_assert_eq!(self.descriptors[id].generation, header.generation);
        id
    }

    /// Payload offset used for a standalone object aligned to `align`.
    #[inline]
    pub const fn large_offset(align: usize) -> usize {
        memory_addr::align_up(SEGMENT_HEADER_SIZE + HEADER_SIZE, align)
    }
}

impl Drop for SegmentPool {
    fn drop(&mut self) {
        self.release_free();
        let leaked: Vec<_> = self.descriptors.drain().collect();
        #[cfg(feature = "tracing")]
        if !leaked.is_empty() {
            tracing::warn!("shard dropped with {} segments in use", leaked.len());
        }
        for desc in leaked {
            self.unmap(desc.base, desc.len);
        }
        debug_assert_eq!(self.mapped, 0);
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::{SEGMENT_HEADER_SIZE, SegmentPool};
    use crate::config::ShardConfig;
    use crate::error::Error;
    use crate::header::{OBJECT_ALIGN, ObjectFlags, ObjectHeader, slot_size};
    use crate::os::HeapBackend;
    use crate::region::RegionId;

    const SEG: usize = 16 * 1024;

    fn pool(segments: usize) -> SegmentPool {
        let conf = ShardConfig::new()
            .with_segment_size(SEG)
            .with_memory_limit(segments * SEG)
            .with_emergency_reserve(1)
            .with_free_segment_cache(2);
        SegmentPool::new(&conf, Box::new(HeapBackend))
    }

    #[test]
    fn acquire_respects_reserve() {
        let mut pool = pool(3);
        let region = RegionId::new(0);
        let a = pool.acquire(region, false).expect("should map");
        let b = pool.acquire(region, false).expect("should map");
        assert!(matches!(
            pool.acquire(region, false),
            Err(Error::OutOfMemory { .. })
        ));
        let c = pool.acquire(region, true).expect("reserve should map");
        assert_eq!(pool.mapped(), 3 * SEG);

        for id in [a, b, c] {
            pool.release(id);
        }
        // cache keeps two, the third goes back
        assert_eq!(pool.free_segments(), 2);
        assert_eq!(pool.mapped(), 2 * SEG);
        assert_eq!(pool.release_free(), 2 * SEG);
        assert_eq!(pool.mapped(), 0);
    }

    #[test]
    fn lookup_and_slots() {
        let mut pool = pool(4);
        let region = RegionId::new(7);
        let id = pool.acquire(region, false).expect("should map");

        let desc = pool.get_mut(id);
        let slot = slot_size(12);
        let mut payloads = vec![];
        for _ in 0..3 {
            let at = desc.bump_aligned(slot, OBJECT_ALIGN).expect("room");
            unsafe {
                at.cast::<ObjectHeader>().write(ObjectHeader::new(
                    12,
                    0,
                    ObjectFlags::empty(),
                    core::ptr::null(),
                ));
                payloads.push(ObjectHeader::at(at.as_ptr()).payload());
            }
        }
        assert_eq!(desc.occupancy(), 3 * slot);
        assert_eq!(desc.dead_space(), 0);
        assert_eq!(desc.free_space() + desc.occupancy() + SEGMENT_HEADER_SIZE, SEG);
        assert_eq!(desc.slots().count(), 3);

        for payload in &payloads {
            assert_eq!(unsafe { pool.lookup(*payload) }, id);
        }

        let desc = pool.get_mut(id);
        unsafe { ObjectHeader::of(payloads[1]).kill() };
        desc.release_slot(slot);
        assert_eq!(desc.dead_space(), slot);
        let live = desc
            .slots()
            .filter(|h| unsafe { h.as_ref().is_live() })
            .count();
        assert_eq!(live, 2);

        desc.release_slot(2 * slot);
        pool.release(id);
    }

    #[test]
    fn aligned_bump_pads_with_filler() {
        let mut pool = pool(2);
        let region = RegionId::new(0);
        let id = pool.acquire(region, false).expect("should map");
        let desc = pool.get_mut(id);

        // a word-sized object leaves the tail off a 32 byte boundary
        let at = desc.bump_aligned(slot_size(8), OBJECT_ALIGN).expect("room");
        unsafe {
            at.cast::<ObjectHeader>().write(ObjectHeader::new(
                8,
                0,
                ObjectFlags::empty(),
                core::ptr::null(),
            ))
        };
        for align in [16, 32, 64] {
            let at = desc.bump_aligned(slot_size(align), align).expect("room");
            unsafe {
                at.cast::<ObjectHeader>().write(ObjectHeader::new(
                    align as u32,
                    0,
                    ObjectFlags::empty(),
                    core::ptr::null(),
                ));
                let payload = ObjectHeader::at(at.as_ptr()).payload();
                assert_eq!(payload.as_ptr() as usize % align, 0);
            }
        }

        let used = slot_size(8) + slot_size(16) + slot_size(32) + slot_size(64);
        assert_eq!(desc.occupancy(), used);
        assert!(desc.dead_space() > 0);
        let live: Vec<_> = desc
            .slots()
            .filter(|h| unsafe { h.as_ref().is_live() })
            .map(|h| unsafe { h.as_ref().size() })
            .collect();
        assert_eq!(live, [8, 16, 32, 64]);

        desc.release_slot(used);
        pool.release(id);
    }

    #[test]
    fn large_segments_bypass_cache() {
        let mut pool = pool(8);
        let region = RegionId::new(0);
        let offset = SegmentPool::large_offset(8);
        let id = pool
            .acquire_large(region, offset, SEG + 1)
            .expect("should map");
        assert!(pool.get(id).is_non_lsa());
        assert!(pool.get(id).len() >= SEG + 1 + offset);
        let at = pool.get_mut(id).place_large(offset, slot_size(SEG + 1));
        assert_eq!(unsafe { pool.lookup(at) }, id);
        unsafe {
            at.sub(16).cast::<ObjectHeader>().write(ObjectHeader::new(
                (SEG + 1) as u32,
                0,
                ObjectFlags::LARGE,
                core::ptr::null(),
            ))
        };
        let headers: Vec<_> = pool.get(id).slots().collect();
        assert_eq!(headers.len(), 1);
        assert_eq!(unsafe { headers[0].as_ref().payload() }, at);

        let slot = pool.get(id).occupancy();
        pool.get_mut(id).release_slot(slot);
        pool.release(id);
        assert_eq!(pool.free_segments(), 0);
        assert_eq!(pool.mapped(), 0);
    }
}
