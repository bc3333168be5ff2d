use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Error, MergeError, Result};
use crate::group::{GroupId, RegionGroup};
use crate::header::{Anchor, HEADER_SIZE, OBJECT_ALIGN, ObjectFlags, ObjectHeader, slot_size};
use crate::managed::{Managed, ManagedBytes};
use crate::migrator::{MigratorId, Migrators};
use crate::segment::{SEGMENT_HEADER_SIZE, SegmentId, SegmentPool};
use crate::shard::{Shard, ShardState};

/// Largest alignment a managed object may ask for.
pub const MAX_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(usize);

impl RegionId {
    #[inline]
    pub(crate) const fn new(idx: usize) -> Self {
        Self(idx)
    }

    #[inline]
    pub(crate) const fn idx(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for RegionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Outcome reported by an eviction callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    Something,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
    used: usize,
    total: usize,
}

impl Occupancy {
    #[inline]
    pub const fn new(used: usize, total: usize) -> Self {
        Self { used, total }
    }

    /// Bytes held by live objects, headers included.
    #[inline]
    pub const fn used_space(&self) -> usize {
        self.used
    }

    /// Bytes of every segment the region owns.
    #[inline]
    pub const fn total_space(&self) -> usize {
        self.total
    }

    #[inline]
    pub const fn free_space(&self) -> usize {
        self.total - self.used
    }
}

impl core::ops::Add for Occupancy {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.used + rhs.used, self.total + rhs.total)
    }
}

impl core::iter::Sum for Occupancy {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), core::ops::Add::add)
    }
}

impl core::fmt::Display for Occupancy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use bytesize::ByteSize;
        write!(
            f,
            "{} / {}",
            ByteSize::b(self.used as u64),
            ByteSize::b(self.total as u64)
        )
    }
}

pub(crate) type Evictor = Box<dyn FnMut() -> Reclaimed>;

pub(crate) struct RegionState {
    pub(crate) segments: Vec<SegmentId>,
    pub(crate) active: Option<SegmentId>,
    pub(crate) used: usize,
    pub(crate) total: usize,
    pub(crate) reclaim_counter: u64,
    pub(crate) lock_count: usize,
    pub(crate) evictor: Option<Evictor>,
    /// Ranked after every other candidate until the region grows.
    pub(crate) demoted: bool,
    pub(crate) group: Option<GroupId>,
    pub(crate) seq: u64,
}

impl core::fmt::Debug for RegionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionState")
            .field("segments", &self.segments.len())
            .field("used", &self.used)
            .field("total", &self.total)
            .field("reclaim_counter", &self.reclaim_counter)
            .field("locked", &self.lock_count)
            .field("evictable", &self.evictor.is_some())
            .field("group", &self.group)
            .finish()
    }
}

impl RegionState {
    #[inline]
    pub fn occupancy(&self) -> Occupancy {
        Occupancy::new(self.used, self.total)
    }

    #[inline]
    pub fn reclaiming_enabled(&self) -> bool {
        self.lock_count == 0
    }
}

/// What a region being torn down still owns: destructors of its live
/// objects and its eviction callback, both run after the state is released.
pub(crate) type Doomed = (Vec<(NonNull<u8>, unsafe fn(*mut u8))>, Option<Evictor>);

impl ShardState {
    pub(crate) fn create_region(&mut self, group: Option<GroupId>) -> RegionId {
        self.seq += 1;
        let id = self.regions.insert(RegionState {
            segments: Vec::new(),
            active: None,
            used: 0,
            total: 0,
            reclaim_counter: 0,
            lock_count: 0,
            evictor: None,
            demoted: false,
            group,
            seq: self.seq,
        });
        if let Some(group) = group {
            self.groups[group.idx()].regions += 1;
        }
        RegionId::new(id)
    }

    #[inline]
    pub(crate) fn region(&self, id: RegionId) -> &RegionState {
        &self.regions[id.idx()]
    }

    #[inline]
    pub(crate) fn region_mut(&mut self, id: RegionId) -> &mut RegionState {
        &mut self.regions[id.idx()]
    }

    /// Applies a change of a region's footprint and charges its groups.
    fn resize_region(&mut self, id: RegionId, delta: isize) {
        let region = &mut self.regions[id.idx()];
        region.total = region.total.saturating_add_signed(delta);
        if delta > 0 {
            region.demoted = false;
        }
        if let Some(group) = region.group {
            self.propagate(group, delta);
        }
    }

    /// Bytes the tracker should try to free before retrying an allocation.
    pub(crate) fn allocation_goal(&self, size: usize, align: usize) -> usize {
        if self.is_large(size) {
            memory_addr::align_up(
                SegmentPool::large_offset(align) + size,
                crate::os::PAGE_SIZE,
            )
        } else {
            self.pool.segment_size()
        }
    }

    /// Only size sends an object out of the log; aligned objects are padded
    /// in place.
    #[inline]
    fn is_large(&self, size: usize) -> bool {
        size > self.config.large_object_threshold()
    }

    pub(crate) fn allocate_in(
        &mut self,
        id: RegionId,
        size: usize,
        align: usize,
        migrator: MigratorId,
        anchor: *const Anchor,
    ) -> Result<NonNull<u8>> {
        if align > MAX_ALIGN || size > u32::MAX as usize {
            return Err(Error::Unsupported { size, align });
        }
        if self.is_large(size) {
            return self.allocate_large(id, size, align, migrator, anchor);
        }

        let slot = slot_size(size);
        let at = self.bump_active(id, slot, align.max(OBJECT_ALIGN), false)?;
        unsafe {
            at.cast::<ObjectHeader>().write(ObjectHeader::new(
                size as u32,
                migrator,
                ObjectFlags::empty(),
                anchor,
            ));
        }
        self.regions[id.idx()].used += slot;
        Ok(unsafe { at.add(HEADER_SIZE) })
    }

    fn allocate_large(
        &mut self,
        id: RegionId,
        size: usize,
        align: usize,
        migrator: MigratorId,
        anchor: *const Anchor,
    ) -> Result<NonNull<u8>> {
        let offset = SegmentPool::large_offset(align);
        let seg = self.pool.acquire_large(id, offset, size)?;
        let slot = slot_size(size);
        let desc = self.pool.get_mut(seg);
        let len = desc.len();
        let payload = desc.place_large(offset, slot);
        unsafe {
            payload
                .sub(HEADER_SIZE)
                .cast::<ObjectHeader>()
                .write(ObjectHeader::new(
                    size as u32,
                    migrator,
                    ObjectFlags::LARGE,
                    anchor,
                ));
        }
        let region = &mut self.regions[id.idx()];
        region.segments.push(seg);
        region.used += slot;
        self.resize_region(id, len as isize);
        Ok(payload)
    }

    /// Carves `slot` bytes from the active segment, opening a new one when
    /// the current tail is too short.
    fn bump_active(
        &mut self,
        id: RegionId,
        slot: usize,
        align: usize,
        reserve: bool,
    ) -> Result<NonNull<u8>> {
        if let Some(active) = self.regions[id.idx()].active
            && let Some(at) = self.pool.get_mut(active).bump_aligned(slot, align)
        {
            return Ok(at);
        }

        let seg = self.pool.acquire(id, reserve)?;
        let region = &mut self.regions[id.idx()];
        region.segments.push(seg);
        region.active = Some(seg);
        self.resize_region(id, self.pool.segment_size() as isize);
        self.pool
            .get_mut(seg)
            .bump_aligned(slot, align)
            .ok_or(Error::Unsupported { size: slot, align })
    }

    /// Marks the object at `payload` dead and frees its segment once empty.
    ///
    /// # Safety
    ///
    /// `payload` must be a live object allocated by this shard.
    pub(crate) unsafe fn free_object(&mut self, payload: NonNull<u8>) {
        let seg = unsafe { self.pool.lookup(payload) };
        let header = unsafe { ObjectHeader::of(payload) };
        header.kill();
        let slot = header.slot_size();

        let desc = self.pool.get_mut(seg);
        desc.release_slot(slot);
        let empty = desc.is_empty();
        let Some(id) = desc.region() else {
            return;
        };
        self.regions[id.idx()].used -= slot;
        if empty {
            self.drop_segment(id, seg);
        }
    }

    fn drop_segment(&mut self, id: RegionId, seg: SegmentId) {
        let region = &mut self.regions[id.idx()];
        if let Some(pos) = region.segments.iter().position(|s| *s == seg) {
            region.segments.swap_remove(pos);
        }
        if region.active == Some(seg) {
            region.active = None;
        }
        let len = self.pool.get(seg).len();
        self.pool.release(seg);
        self.resize_region(id, -(len as isize));
    }

    /// Region owning the object at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be a live object allocated by this shard.
    pub(crate) unsafe fn owner_of(&self, payload: NonNull<u8>) -> Option<RegionId> {
        let seg = unsafe { self.pool.lookup(payload) };
        self.pool.get(seg).region()
    }

    #[inline]
    fn closed_segments(&self, id: RegionId) -> impl Iterator<Item = SegmentId> + '_ {
        let region = &self.regions[id.idx()];
        region
            .segments
            .iter()
            .copied()
            .filter(move |seg| Some(*seg) != region.active && !self.pool.get(*seg).is_non_lsa())
    }

    /// Dead bytes sitting in closed segments, the space one compaction pass
    /// could hand back.
    pub(crate) fn compactible(&self, id: RegionId) -> usize {
        self.closed_segments(id)
            .map(|seg| self.pool.get(seg).dead_space())
            .sum()
    }

    /// Evacuates every live object of `src` into the region's active
    /// segment and releases `src`.
    fn compact_segment(&mut self, id: RegionId, src: SegmentId) -> Result<()> {
        let region = &mut self.regions[id.idx()];
        if region.active == Some(src) {
            region.active = None;
        }

        for header in self.pool.get(src).slots() {
            let header = unsafe { &mut *header.as_ptr() };
            if !header.is_live() {
                continue;
            }
            let slot = header.slot_size();
            let align = self.migrators.get(header.migrator()).align();
            let dst = self.bump_active(id, slot, align, true)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (header as *const ObjectHeader).cast::<u8>(),
                    dst.as_ptr(),
                    slot,
                );
                let moved = ObjectHeader::at(dst.as_ptr());
                if let Some(anchor) = moved.anchor() {
                    anchor.set(moved.payload());
                }
            }
            header.kill();
            self.pool.get_mut(src).release_slot(slot);
            self.pool.stats.add_objects_migrated(1);
            self.pool.stats.add_bytes_migrated(slot);
        }

        self.pool.stats.add_segments_compacted(1);
        self.drop_segment(id, src);
        Ok(())
    }

    /// Compacts the sparsest closed segment of a region.
    ///
    /// Returns whether anything moved.
    pub(crate) fn compact_step(&mut self, id: RegionId) -> Result<bool> {
        if !self.regions[id.idx()].reclaiming_enabled() {
            return Ok(false);
        }
        let victim = self
            .closed_segments(id)
            .filter(|seg| self.pool.get(*seg).dead_space() > 0)
            .min_by_key(|seg| self.pool.get(*seg).occupancy());
        let Some(src) = victim else {
            return Ok(false);
        };

        self.regions[id.idx()].reclaim_counter += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "compacting segment of {} holding {} bytes",
            id,
            self.pool.get(src).occupancy()
        );
        self.compact_segment(id, src)?;
        Ok(true)
    }

    /// Returns whether the pass ran.
    pub(crate) fn full_compaction(&mut self, id: RegionId) -> bool {
        if !self.regions[id.idx()].reclaiming_enabled() {
            return false;
        }
        let mut sources: Vec<_> = self.regions[id.idx()]
            .segments
            .iter()
            .copied()
            .filter(|seg| {
                let desc = self.pool.get(*seg);
                !desc.is_non_lsa() && desc.dead_space() > 0
            })
            .collect();
        if sources.is_empty() {
            return false;
        }
        sources.sort_by_key(|seg| self.pool.get(*seg).occupancy());

        let region = &mut self.regions[id.idx()];
        region.reclaim_counter += 1;
        if region.active.is_some_and(|active| sources.contains(&active)) {
            region.active = None;
        }

        #[cfg(feature = "tracing")]
        let before = region.total;
        for src in sources {
            if let Err(_err) = self.compact_segment(id, src) {
                #[cfg(feature = "tracing")]
                tracing::warn!("full compaction of {} stopped early: {}", id, _err);
                break;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "full compaction of {}: {} -> {}",
            id,
            bytesize::ByteSize::b(before as u64),
            bytesize::ByteSize::b(self.regions[id.idx()].total as u64)
        );
        true
    }

    /// Moves every segment of `src` into `dst`.
    pub(crate) fn merge_regions(&mut self, dst: RegionId, src: RegionId) -> Result<(), MergeError> {
        if dst == src {
            return Err(MergeError::SameRegion);
        }
        if !self.region(dst).reclaiming_enabled() || !self.region(src).reclaiming_enabled() {
            return Err(MergeError::ReclaimLocked);
        }

        let from = &mut self.regions[src.idx()];
        let segments = core::mem::take(&mut from.segments);
        let used = core::mem::take(&mut from.used);
        let total = from.total;
        from.active = None;
        for seg in &segments {
            self.pool.get_mut(*seg).set_region(dst);
        }

        // release the old ancestors before charging the new ones
        self.resize_region(src, -(total as isize));
        let to = &mut self.regions[dst.idx()];
        to.segments.extend(segments);
        to.used += used;
        self.resize_region(dst, total as isize);
        Ok(())
    }

    /// Detaches every live object of a region being dropped.
    ///
    /// Handles see their objects as dead from here on; the returned
    /// destructors must run before [`Self::destroy_region`].
    pub(crate) fn doom_region(&mut self, id: RegionId) -> Doomed {
        let region = &mut self.regions[id.idx()];
        region.lock_count += 1;
        let evictor = region.evictor.take();

        let mut doomed = Vec::new();
        for seg in &region.segments {
            for header in self.pool.get(*seg).slots() {
                let header = unsafe { &*header.as_ptr() };
                if !header.is_live() {
                    continue;
                }
                if let Some(anchor) = header.anchor() {
                    anchor.clear();
                }
                if let Some(drop) = self.migrators.get(header.migrator()).drop_fn() {
                    doomed.push((header.payload(), drop));
                }
            }
        }
        (doomed, evictor)
    }

    pub(crate) fn destroy_region(&mut self, id: RegionId) {
        let region = &mut self.regions[id.idx()];
        let segments = core::mem::take(&mut region.segments);
        let total = region.total;
        for seg in segments {
            self.pool.get_mut(seg).clear();
            self.pool.release(seg);
        }
        self.resize_region(id, -(total as isize));
        let region = self.regions.remove(id.idx());
        if let Some(group) = region.group
            && let Some(node) = self.groups.get_mut(group.idx())
        {
            node.regions -= 1;
        }
    }
}

/// A logical arena of movable objects.
///
/// References into a region stay valid until its
/// [`reclaim_counter`](Region::reclaim_counter) advances; hold a
/// [`ReclaimLock`] to keep them valid across allocations elsewhere.
pub struct Region {
    shard: Shard,
    id: RegionId,
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shard.state_ref();
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("state", state.region(self.id))
            .finish()
    }
}

impl Region {
    pub fn new(shard: &Shard) -> Self {
        let id = shard.state().create_region(None);
        Self {
            shard: shard.clone(),
            id,
        }
    }

    /// A region whose footprint is charged to `group` and its ancestors.
    pub fn with_group(group: &RegionGroup) -> Self {
        let shard = group.shard();
        let id = shard.state().create_region(Some(group.id()));
        Self {
            shard: shard.clone(),
            id,
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// Moves `value` into the region.
    pub fn allocate<T: 'static>(&self, value: T) -> Result<Managed<T>> {
        let migrator = self.shard.state().migrators.register::<T>();
        let anchor = Box::new(Anchor::dead());
        let ptr = self.shard.allocate(
            self.id,
            size_of::<T>(),
            align_of::<T>(),
            migrator,
            &*anchor,
        )?;
        unsafe { ptr.cast::<T>().write(value) };
        anchor.set(ptr);
        self.shard.flush();
        Ok(unsafe { Managed::from_anchor(anchor, self.shard.clone()) })
    }

    /// A zeroed blob of `len` bytes.
    pub fn allocate_bytes(&self, len: usize) -> Result<ManagedBytes> {
        let anchor = Box::new(Anchor::dead());
        let ptr = self
            .shard
            .allocate(self.id, len, 1, Migrators::BYTES, &*anchor)?;
        unsafe { ptr.write_bytes(0, len) };
        anchor.set(ptr);
        self.shard.flush();
        Ok(unsafe { ManagedBytes::from_anchor(anchor, len, self.shard.clone()) })
    }

    pub fn allocate_copy(&self, data: &[u8]) -> Result<ManagedBytes> {
        let anchor = Box::new(Anchor::dead());
        let ptr = self
            .shard
            .allocate(self.id, data.len(), 1, Migrators::BYTES, &*anchor)?;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        anchor.set(ptr);
        self.shard.flush();
        Ok(unsafe { ManagedBytes::from_anchor(anchor, data.len(), self.shard.clone()) })
    }

    /// Destroys an object of this region.
    pub fn destroy<T: 'static>(&self, object: Managed<T>) {
        debug_assert!(
            !object.is_live() || object.region() == Some(self.id),
            "object destroyed through a foreign region"
        );
        drop(object);
    }

    /// Absorbs every segment of `other`, which is left empty.
    pub fn merge(&self, other: &Region) -> Result<()> {
        if !self.shard.ptr_eq(&other.shard) {
            return Err(MergeError::CrossShard.into());
        }
        self.shard.state().merge_regions(self.id, other.id)?;
        self.shard.flush();
        Ok(())
    }

    /// Registers the callback the tracker invokes to shed memory.
    pub fn make_evictable<F>(&self, evict: F)
    where
        F: FnMut() -> Reclaimed + 'static,
    {
        let old = {
            let mut state = self.shard.state();
            let region = state.region_mut(self.id);
            region.demoted = false;
            region.evictor.replace(Box::new(evict))
        };
        drop(old);
    }

    pub fn is_evictable(&self) -> bool {
        self.shard.state_ref().region(self.id).evictor.is_some()
    }

    /// Compacts every sparse segment. A no-op under a reclaim lock.
    pub fn full_compaction(&self) {
        self.shard.state().full_compaction(self.id);
        self.shard.flush();
    }

    #[inline]
    pub fn reclaim_counter(&self) -> u64 {
        self.shard.state_ref().region(self.id).reclaim_counter
    }

    #[inline]
    pub fn occupancy(&self) -> Occupancy {
        self.shard.state_ref().region(self.id).occupancy()
    }

    #[inline]
    pub fn reclaiming_enabled(&self) -> bool {
        self.shard.state_ref().region(self.id).reclaiming_enabled()
    }

    /// Disables compaction and eviction of this region until dropped.
    pub fn reclaim_lock(&self) -> ReclaimLock<'_> {
        self.shard.lock_region(self.id);
        ReclaimLock { region: self }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let (doomed, evictor) = self.shard.state().doom_region(self.id);
        drop(evictor);
        for (payload, drop) in doomed {
            unsafe { drop(payload.as_ptr()) };
        }
        self.shard.state().destroy_region(self.id);
        self.shard.flush();
    }
}

/// Scoped guard that keeps a region's objects in place.
#[must_use = "the region is unlocked as soon as the guard is dropped"]
pub struct ReclaimLock<'r> {
    region: &'r Region,
}

impl ReclaimLock<'_> {
    #[inline]
    pub fn region(&self) -> &Region {
        self.region
    }
}

impl Drop for ReclaimLock<'_> {
    fn drop(&mut self) {
        self.region.shard.unlock_region(self.region.id);
    }
}

/// Bytes a fresh segment offers to objects.
#[inline]
pub(crate) const fn segment_capacity(segment_size: usize) -> usize {
    segment_size - SEGMENT_HEADER_SIZE
}
