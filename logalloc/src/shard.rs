use core::cell::{Cell, Ref, RefCell, RefMut};
use core::ptr::NonNull;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use alloc::boxed::Box;
use alloc::vec::Vec;
use bytesize::ByteSize;
use slab::Slab;

use crate::config::{NothingReclaimed, ShardConfig};
use crate::error::{Error, Result};
use crate::group::{GroupId, GroupNode};
use crate::header::Anchor;
use crate::migrator::{MigratorId, Migrators};
use crate::os::{Backend, DefaultBackend};
use crate::region::{Occupancy, Reclaimed, RegionId, RegionState, segment_capacity};
use crate::segment::SegmentPool;
use crate::stats::Stats;

/// Work queued while the shard state is borrowed and carried out after the
/// borrow ends, since it may run user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    StartReclaiming(GroupId),
    StopReclaiming(GroupId),
    SpawnReclaim(GroupId),
    Release,
}

/// How an eviction attempt on one region ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Evicted {
    Returned(Reclaimed),
    /// The callback panicked and has been deregistered.
    Panicked,
    /// No callback, or the region is reclaim-locked.
    Skipped,
}

pub(crate) struct ShardState {
    pub(crate) config: ShardConfig,
    pub(crate) pool: SegmentPool,
    pub(crate) regions: Slab<RegionState>,
    pub(crate) groups: Slab<GroupNode>,
    pub(crate) migrators: Migrators,
    pub(crate) effects: VecDeque<Effect>,
    pub(crate) seq: u64,
}

impl ShardState {
    fn new(config: ShardConfig, backend: Box<dyn Backend>) -> Self {
        Self {
            pool: SegmentPool::new(&config, backend),
            config,
            regions: Slab::new(),
            groups: Slab::new(),
            migrators: Migrators::new(),
            effects: VecDeque::new(),
            seq: 0,
        }
    }

    /// Region with the most dead space in closed segments, provided it is
    /// at least one segment's worth.
    fn compaction_candidate(&self) -> Option<RegionId> {
        let floor = segment_capacity(self.pool.segment_size());
        self.regions
            .iter()
            .filter(|(_, region)| region.reclaiming_enabled())
            .map(|(id, _)| RegionId::new(id))
            .map(|id| (self.compactible(id), id))
            .filter(|(dead, _)| *dead >= floor)
            .max_by_key(|(dead, id)| (*dead, core::cmp::Reverse(*id)))
            .map(|(_, id)| id)
    }

    /// Largest evictable region not yet given up on in this pass.
    fn eviction_candidate(&self, skip: &[RegionId]) -> Option<RegionId> {
        self.regions
            .iter()
            .filter(|(_, region)| region.reclaiming_enabled() && region.evictor.is_some())
            .map(|(id, region)| (RegionId::new(id), region))
            .filter(|(id, region)| !skip.contains(id) && region.total > 0)
            .min_by_key(|(_, region)| {
                (
                    region.demoted,
                    core::cmp::Reverse(region.total),
                    region.seq,
                )
            })
            .map(|(id, _)| id)
    }
}

pub(crate) struct ShardInner {
    state: RefCell<ShardState>,
    releasing: Cell<bool>,
}

/// One allocator instance, owned by a single execution context.
///
/// Cloning is cheap and yields another handle to the same shard.
#[derive(Clone)]
pub struct Shard {
    inner: Rc<ShardInner>,
}

impl core::fmt::Debug for Shard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state_ref();
        f.debug_struct("Shard")
            .field("pool", &state.pool)
            .field("regions", &state.regions.len())
            .field("groups", &state.groups.len())
            .finish()
    }
}

std::thread_local! {
    static LOCAL: Shard = Shard::new(ShardConfig::default());
}

impl Shard {
    pub fn new(config: ShardConfig) -> Self {
        Self::with_backend(config, DefaultBackend::default())
    }

    pub fn with_backend<B: Backend + 'static>(config: ShardConfig, backend: B) -> Self {
        let config = config.validate();
        #[cfg(feature = "tracing")]
        tracing::debug!("new shard: {}", config);
        Self {
            inner: Rc::new(ShardInner {
                state: RefCell::new(ShardState::new(config, Box::new(backend))),
                releasing: Cell::new(false),
            }),
        }
    }

    /// This thread's default shard.
    pub fn local() -> Self {
        LOCAL.with(Clone::clone)
    }

    #[inline]
    pub(crate) fn state(&self) -> RefMut<'_, ShardState> {
        self.inner.state.borrow_mut()
    }

    #[inline]
    pub(crate) fn state_ref(&self) -> Ref<'_, ShardState> {
        self.inner.state.borrow()
    }

    #[inline]
    pub(crate) fn ptr_eq(&self, other: &Shard) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<ShardInner> {
        Rc::downgrade(&self.inner)
    }

    #[inline]
    pub(crate) fn upgrade(weak: &Weak<ShardInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> ShardConfig {
        self.state_ref().config
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.state_ref().pool.segment_size()
    }

    /// Bytes currently mapped from the backend, idle segments included.
    #[inline]
    pub fn memory_mapped(&self) -> usize {
        self.state_ref().pool.mapped()
    }

    #[inline]
    pub fn free_segments(&self) -> usize {
        self.state_ref().pool.free_segments()
    }

    /// Aggregate over every region of the shard.
    pub fn occupancy(&self) -> Occupancy {
        self.state_ref()
            .regions
            .iter()
            .map(|(_, region)| region.occupancy())
            .sum()
    }

    pub fn stats(&self) -> Stats {
        self.state_ref().pool.stats
    }

    /// Returns every idle segment to the backend.
    pub fn reclaim_all_free_segments(&self) -> usize {
        let freed = self.state().pool.release_free();
        #[cfg(feature = "tracing")]
        if freed > 0 {
            tracing::debug!("returned {} of idle segments", ByteSize::b(freed as u64));
        }
        freed
    }

    /// Frees at least `bytes` if it can: idle segments first, then
    /// compaction of the sparsest regions, then eviction of the largest
    /// evictable ones. Locked regions are left alone.
    ///
    /// Returns the net bytes handed back to the backend.
    pub fn reclaim(&self, bytes: usize) -> usize {
        let reclaimed = self.reclaim_inner(bytes);
        self.flush();
        reclaimed
    }

    fn reclaim_inner(&self, goal: usize) -> usize {
        let (before, draining) = {
            let mut state = self.state();
            state.pool.stats.add_reclaims(1);
            let draining = state.pool.set_draining(true);
            let before = state.pool.mapped();
            state.pool.release_free();
            (before, draining)
        };
        let net = |shard: &Shard| before as isize - shard.memory_mapped() as isize;

        let mut given_up = Vec::new();
        while net(self) < goal as isize {
            let compacted = {
                let mut state = self.state();
                match state.compaction_candidate() {
                    Some(id) => state.compact_step(id).unwrap_or(false),
                    None => false,
                }
            };
            if compacted {
                continue;
            }

            let Some(victim) = self.state_ref().eviction_candidate(&given_up) else {
                break;
            };
            let used = self.state_ref().region(victim).used;
            let progressed = match self.evict(victim) {
                Evicted::Returned(Reclaimed::Something) => self
                    .state_ref()
                    .regions
                    .get(victim.idx())
                    .is_none_or(|region| region.used < used),
                _ => false,
            };
            if !progressed {
                given_up.push(victim);
            }
            self.state().pool.release_free();
        }

        let reclaimed = net(self).max(0) as usize;
        let mut state = self.state();
        state.pool.set_draining(draining);
        state.pool.stats.add_bytes_reclaimed(reclaimed);
        #[cfg(feature = "tracing")]
        if reclaimed > 0 {
            tracing::info!(
                "reclaimed {} of {} requested",
                ByteSize::b(reclaimed as u64),
                ByteSize::b(goal as u64)
            );
        }
        reclaimed
    }

    /// Runs a region's eviction callback with the state released.
    pub(crate) fn evict(&self, id: RegionId) -> Evicted {
        let (mut evictor, seq) = {
            let mut state = self.state();
            let Some(region) = state.regions.get_mut(id.idx()) else {
                return Evicted::Skipped;
            };
            if !region.reclaiming_enabled() {
                return Evicted::Skipped;
            }
            let Some(evictor) = region.evictor.take() else {
                return Evicted::Skipped;
            };
            (evictor, region.seq)
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| evictor()));
        let policy = self.config().nothing_reclaimed();

        let rejected = {
            let mut state = self.state();
            let keep = match outcome {
                Ok(Reclaimed::Something) => {
                    state.pool.stats.add_evictions(1);
                    true
                }
                Ok(Reclaimed::Nothing) => {
                    state.pool.stats.add_failed_evictions(1);
                    policy == NothingReclaimed::Demote
                }
                Err(_) => {
                    state.pool.stats.add_failed_evictions(1);
                    #[cfg(feature = "tracing")]
                    tracing::warn!("eviction callback of {} panicked, deregistering it", id);
                    false
                }
            };
            match state.regions.get_mut(id.idx()) {
                Some(region) if region.seq == seq && keep && region.evictor.is_none() => {
                    if outcome.as_ref().is_ok_and(|r| *r == Reclaimed::Nothing) {
                        region.demoted = true;
                    }
                    region.evictor = Some(evictor);
                    None
                }
                _ => Some(evictor),
            }
        };
        drop(rejected);

        match outcome {
            Ok(outcome) => Evicted::Returned(outcome),
            Err(_) => Evicted::Panicked,
        }
    }

    /// Allocates room for an object, reclaiming once on failure.
    ///
    /// Effects are left queued: the caller initialises the object and then
    /// flushes.
    pub(crate) fn allocate(
        &self,
        id: RegionId,
        size: usize,
        align: usize,
        migrator: MigratorId,
        anchor: *const Anchor,
    ) -> Result<NonNull<u8>> {
        let first = self
            .state()
            .allocate_in(id, size, align, migrator, anchor);
        let err = match first {
            Err(err @ Error::OutOfMemory { .. }) => err,
            other => return other,
        };

        let (locked, goal) = {
            let state = self.state_ref();
            (
                !state.region(id).reclaiming_enabled(),
                state.allocation_goal(size, align),
            )
        };
        let retried = if locked {
            Err(err)
        } else {
            self.reclaim_inner(goal);
            self.state()
                .allocate_in(id, size, align, migrator, anchor)
        };
        if let Err(_err) = &retried {
            self.state().pool.stats.add_allocation_failures(1);
            #[cfg(feature = "tracing")]
            tracing::debug!("allocation of {} in {} failed: {}", size, id, _err);
        }
        retried
    }

    pub(crate) fn lock_region(&self, id: RegionId) {
        self.state().region_mut(id).lock_count += 1;
    }

    pub(crate) fn unlock_region(&self, id: RegionId) {
        let mut state = self.state();
        if let Some(region) = state.regions.get_mut(id.idx()) {
            debug_assert!(region.lock_count > 0);
            region.lock_count -= 1;
        }
    }

    /// Destroys the object at `payload` once its destructor, if any, ran.
    ///
    /// # Safety
    ///
    /// `payload` must be a live object of this shard whose value has been
    /// dropped or needs no drop.
    pub(crate) unsafe fn free_object(&self, payload: NonNull<u8>) {
        unsafe { self.state().free_object(payload) };
        self.flush();
    }

    /// Carries out queued effects. Safe to call re-entrantly.
    pub(crate) fn flush(&self) {
        loop {
            let effect = self.state().effects.pop_front();
            let Some(effect) = effect else {
                break;
            };
            match effect {
                Effect::StartReclaiming(group) | Effect::StopReclaiming(group) => {
                    let reclaimer = self.state_ref().reclaimer(group);
                    if let Some(reclaimer) = reclaimer {
                        if effect == Effect::StartReclaiming(group) {
                            reclaimer.start_reclaiming();
                        } else {
                            reclaimer.stop_reclaiming();
                        }
                    }
                }
                Effect::SpawnReclaim(group) => self.spawn_reclaim(group),
                Effect::Release => self.release_pending(),
            }
        }
    }

    /// Runs queued admission requests whose groups have left pressure.
    fn release_pending(&self) {
        struct Releasing<'a>(&'a Cell<bool>);
        impl Drop for Releasing<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }

        if self.inner.releasing.replace(true) {
            return;
        }
        let _guard = Releasing(&self.inner.releasing);
        loop {
            let next = self.state().next_admissible();
            match next {
                Some(run) => run(),
                None => break,
            }
        }
    }
}
