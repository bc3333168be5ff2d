//! Hierarchical accounting of region footprints with admission control.

mod admission;
mod reclaimer;

pub use self::admission::Admission;
pub use self::reclaimer::{ActiveReclaimer, Limits, Reclaimer, Unlimited};

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bytesize::ByteSize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::region::{Reclaimed, RegionId};
use crate::shard::{Effect, Evicted, Shard, ShardInner, ShardState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

impl GroupId {
    #[inline]
    pub(crate) const fn idx(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for GroupId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// At or below the soft limit.
    Idle,
    /// Above the soft limit; reclaim is running.
    Soft,
    /// Above the hard limit; admission blocks.
    Hard,
}

struct Pending {
    origin: GroupId,
    ticket: u64,
    run: Box<dyn FnOnce()>,
}

pub(crate) struct GroupNode {
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    reclaimer: Rc<dyn Reclaimer>,
    soft: usize,
    hard: usize,
    active: bool,
    memory_used: usize,
    over_soft: bool,
    under_pressure: bool,
    queue: VecDeque<Pending>,
    task: Option<JoinHandle<()>>,
    shutdown: bool,
    pub(crate) regions: usize,
    name: Option<String>,
    seq: u64,
}

impl core::fmt::Debug for GroupNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GroupNode")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("memory_used", &ByteSize::b(self.memory_used as u64))
            .field("soft", &self.soft)
            .field("hard", &self.hard)
            .field("over_soft", &self.over_soft)
            .field("under_pressure", &self.under_pressure)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl GroupNode {
    fn state(&self) -> GroupState {
        if self.under_pressure {
            GroupState::Hard
        } else if self.over_soft {
            GroupState::Soft
        } else {
            GroupState::Idle
        }
    }
}

type Drained = (Vec<Pending>, Option<JoinHandle<()>>);

impl ShardState {
    fn create_group(&mut self, parent: Option<GroupId>, reclaimer: Rc<dyn Reclaimer>) -> GroupId {
        let hard = reclaimer.hard_limit();
        let soft = reclaimer.soft_limit().min(hard);
        let active = reclaimer.active();
        self.seq += 1;
        let id = GroupId(self.groups.insert(GroupNode {
            parent,
            children: Vec::new(),
            reclaimer,
            soft,
            hard,
            active,
            memory_used: 0,
            over_soft: false,
            under_pressure: false,
            queue: VecDeque::new(),
            task: None,
            shutdown: false,
            regions: 0,
            name: None,
            seq: self.seq,
        }));
        if let Some(parent) = parent {
            self.groups[parent.0].children.push(id);
        }
        id
    }

    #[inline]
    fn group(&self, id: GroupId) -> &GroupNode {
        &self.groups[id.0]
    }

    pub(crate) fn reclaimer(&self, id: GroupId) -> Option<Rc<dyn Reclaimer>> {
        self.groups.get(id.0).map(|node| node.reclaimer.clone())
    }

    fn ancestors(&self, id: GroupId) -> impl Iterator<Item = GroupId> + '_ {
        core::iter::successors(Some(id), |id| self.groups.get(id.0)?.parent)
    }

    /// Charges `delta` to a group and every ancestor, re-evaluating their
    /// thresholds on the way up.
    pub(crate) fn propagate(&mut self, id: GroupId, delta: isize) {
        let mut cur = Some(id);
        while let Some(id) = cur {
            let Some(node) = self.groups.get_mut(id.0) else {
                break;
            };
            node.memory_used = node.memory_used.saturating_add_signed(delta);
            let over_soft = node.memory_used > node.soft;
            let under_pressure = node.memory_used > node.hard;

            if over_soft != node.over_soft {
                node.over_soft = over_soft;
                self.effects.push_back(if over_soft {
                    Effect::StartReclaiming(id)
                } else {
                    Effect::StopReclaiming(id)
                });
            }
            if over_soft && delta > 0 && node.active && !node.shutdown {
                self.effects.push_back(Effect::SpawnReclaim(id));
            }
            if under_pressure != node.under_pressure {
                node.under_pressure = under_pressure;
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "{} {} pressure at {}",
                    id,
                    if under_pressure { "entered" } else { "left" },
                    ByteSize::b(node.memory_used as u64)
                );
                if !under_pressure {
                    self.effects.push_back(Effect::Release);
                }
            }
            cur = node.parent;
        }
    }

    /// Queue a request from `id` must wait on, if any: the deepest group on
    /// the path that is under pressure or already holds waiters.
    fn admission_target(&self, id: GroupId) -> Option<GroupId> {
        self.ancestors(id).find(|g| {
            let node = self.group(*g);
            node.under_pressure || !node.queue.is_empty()
        })
    }

    fn admissible(&self, origin: GroupId) -> bool {
        self.ancestors(origin)
            .all(|g| self.groups.get(g.0).is_none_or(|node| !node.under_pressure))
    }

    /// Pops the oldest queue head whose origin and ancestors all left
    /// pressure.
    pub(crate) fn next_admissible(&mut self) -> Option<Box<dyn FnOnce()>> {
        let id = self
            .groups
            .iter()
            .filter_map(|(id, node)| Some((id, node.queue.front()?)))
            .filter(|(_, pending)| self.admissible(pending.origin))
            .min_by_key(|(_, pending)| pending.ticket)
            .map(|(id, _)| id)?;
        let pending = self.groups[id].queue.pop_front()?;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "releasing request of {} queued at group#{}",
            pending.origin,
            id
        );
        Some(pending.run)
    }

    /// Regions of the subtree rooted at `id`, worst offender first.
    fn victims(&self, id: GroupId) -> Vec<RegionId> {
        let mut victims: Vec<_> = self
            .regions
            .iter()
            .filter(|(_, region)| region.reclaiming_enabled() && region.total > 0)
            .filter(|(_, region)| {
                region
                    .group
                    .is_some_and(|group| self.ancestors(group).any(|g| g == id))
            })
            .map(|(rid, region)| ((region.demoted, core::cmp::Reverse(region.total), region.seq), rid))
            .collect();
        victims.sort_unstable_by_key(|(key, _)| *key);
        victims
            .into_iter()
            .map(|(_, rid)| RegionId::new(rid))
            .collect()
    }

    fn largest_region(&self, id: GroupId) -> Option<(RegionId, usize)> {
        self.regions
            .iter()
            .filter(|(_, region)| {
                region
                    .group
                    .is_some_and(|group| self.ancestors(group).any(|g| g == id))
            })
            .min_by_key(|(_, region)| (core::cmp::Reverse(region.total), region.seq))
            .map(|(rid, region)| (RegionId::new(rid), region.total))
    }

    /// Stops a group from taking or running work and hands back what it
    /// still holds.
    fn begin_shutdown(&mut self, id: GroupId) -> Drained {
        let node = &mut self.groups[id.0];
        node.shutdown = true;
        let task = node.task.take();
        let mut pending: Vec<_> = node.queue.drain(..).collect();

        let ancestors: Vec<_> = self.ancestors(id).skip(1).collect();
        for g in ancestors {
            let queue = &mut self.groups[g.0].queue;
            let (theirs, kept): (Vec<_>, Vec<_>) = queue.drain(..).partition(|p| p.origin == id);
            queue.extend(kept);
            pending.extend(theirs);
        }
        (pending, task)
    }

    /// Unlinks a group from the tree.
    fn remove_group(&mut self, id: GroupId) -> Vec<Pending> {
        let (pending, _) = self.begin_shutdown(id);
        let node = &self.groups[id.0];
        debug_assert!(node.children.is_empty(), "group shut down with child groups");
        debug_assert_eq!(node.regions, 0, "group shut down with bound regions");
        #[cfg(feature = "tracing")]
        if node.regions > 0 || !node.children.is_empty() {
            tracing::warn!(
                "{} detached with {} regions and {} child groups",
                id,
                node.regions,
                node.children.len()
            );
        }

        let (parent, used) = (node.parent, node.memory_used);
        if let Some(parent) = parent {
            self.propagate(parent, -(used as isize));
            self.groups[parent.0].children.retain(|child| *child != id);
        }
        let node = self.groups.remove(id.0);
        for child in node.children {
            self.groups[child.0].parent = None;
        }
        for (_, region) in self.regions.iter_mut() {
            if region.group == Some(id) {
                region.group = None;
            }
        }
        // requests held back by this group may now go
        self.effects.push_back(Effect::Release);
        pending
    }
}

impl Shard {
    /// Starts the eviction task of an active group unless one is running.
    pub(crate) fn spawn_reclaim(&self, id: GroupId) {
        let seq = {
            let state = self.state_ref();
            let Some(node) = state.groups.get(id.0) else {
                return;
            };
            let running = node.task.as_ref().is_some_and(|task| !task.is_finished());
            if running || node.shutdown || !node.over_soft {
                return;
            }
            node.seq
        };
        // spawn_local panics outside a LocalSet, and tokio offers no way to
        // ask first
        let task = tokio::runtime::Handle::try_current().ok().and_then(|_| {
            let weak = self.downgrade();
            catch_unwind(AssertUnwindSafe(move || {
                tokio::task::spawn_local(reclaim_task(weak, id, seq))
            }))
            .ok()
        });
        let Some(task) = task else {
            #[cfg(feature = "tracing")]
            tracing::warn!("no local task set to run the reclaim task of {}, skipping", id);
            return;
        };
        #[cfg(feature = "tracing")]
        tracing::debug!("spawning reclaim task of {}", id);
        if let Some(node) = self.state().groups.get_mut(id.0) {
            node.task = Some(task);
        }
    }

    /// One step of a group's eviction task. Returns whether to go on.
    fn reclaim_step(&self, id: GroupId, seq: u64) -> bool {
        let victims = {
            let state = self.state_ref();
            match state.groups.get(id.0) {
                Some(node) if node.seq == seq && !node.shutdown && node.over_soft => {
                    state.victims(id)
                }
                _ => return false,
            }
        };

        let mut progressed = false;
        for victim in victims {
            // an earlier callback may have dropped this region
            let evictable = match self.state_ref().regions.get(victim.idx()) {
                Some(region) => region.evictor.is_some(),
                None => continue,
            };
            if evictable {
                match self.evict(victim) {
                    Evicted::Returned(outcome) => {
                        progressed = outcome == Reclaimed::Something;
                        break;
                    }
                    // a panicking callback is gone; try the next region
                    Evicted::Panicked | Evicted::Skipped => continue,
                }
            }
            let compacted = self.state().compact_step(victim).unwrap_or(false);
            if compacted {
                progressed = true;
                break;
            }
        }
        self.flush();
        progressed
    }
}

async fn reclaim_task(shard: Weak<ShardInner>, id: GroupId, seq: u64) {
    loop {
        let Some(shard) = Shard::upgrade(&shard) else {
            break;
        };
        if !shard.reclaim_step(id, seq) {
            break;
        }
        drop(shard);
        tokio::task::yield_now().await;
    }
    #[cfg(feature = "tracing")]
    tracing::debug!("reclaim task of {} finished", id);
}

/// A node in the tree of accounting buckets.
///
/// Dropping a group detaches it like [`RegionGroup::shutdown`] without
/// waiting for its reclaim task, which is aborted.
pub struct RegionGroup {
    shard: Shard,
    id: GroupId,
    detached: bool,
}

impl core::fmt::Debug for RegionGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shard.state_ref();
        f.debug_struct("RegionGroup")
            .field("id", &self.id)
            .field("node", state.group(self.id))
            .finish()
    }
}

impl RegionGroup {
    /// A root group on `shard`.
    pub fn new<R: Reclaimer + 'static>(shard: &Shard, reclaimer: R) -> Self {
        let id = shard.state().create_group(None, Rc::new(reclaimer));
        Self {
            shard: shard.clone(),
            id,
            detached: false,
        }
    }

    pub fn child<R: Reclaimer + 'static>(&self, reclaimer: R) -> Self {
        let id = self
            .shard
            .state()
            .create_group(Some(self.id), Rc::new(reclaimer));
        Self {
            shard: self.shard.clone(),
            id,
            detached: false,
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.shard.state().groups[self.id.0].name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<String> {
        self.shard.state_ref().group(self.id).name.clone()
    }

    #[inline]
    pub fn id(&self) -> GroupId {
        self.id
    }

    #[inline]
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.shard.state_ref().group(self.id).parent
    }

    /// Footprint of every region in the subtree plus declared updates.
    pub fn memory_used(&self) -> usize {
        self.shard.state_ref().group(self.id).memory_used
    }

    pub fn under_pressure(&self) -> bool {
        self.shard.state_ref().group(self.id).under_pressure
    }

    pub fn over_soft_limit(&self) -> bool {
        self.shard.state_ref().group(self.id).over_soft
    }

    pub fn state(&self) -> GroupState {
        self.shard.state_ref().group(self.id).state()
    }

    pub fn soft_limit(&self) -> usize {
        self.shard.state_ref().group(self.id).soft
    }

    pub fn hard_limit(&self) -> usize {
        self.shard.state_ref().group(self.id).hard
    }

    /// Requests waiting on this group's queue.
    pub fn pending(&self) -> usize {
        self.shard.state_ref().group(self.id).queue.len()
    }

    /// The worst offender of the subtree and its footprint.
    pub fn largest_region(&self) -> Option<(RegionId, usize)> {
        self.shard.state_ref().largest_region(self.id)
    }

    /// Declares a footprint change ahead of the allocation behind it.
    pub fn update(&self, delta: isize) {
        self.shard.state().propagate(self.id, delta);
        self.shard.flush();
    }

    /// Runs `f` now if neither this group nor any ancestor is under
    /// pressure, otherwise queues it behind earlier requests.
    pub fn run_when_memory_available<F, R>(&self, f: F) -> Admission<R>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        let target = self.shard.state_ref().admission_target(self.id);
        let Some(target) = target else {
            return Admission::ready(f());
        };

        let (tx, rx) = oneshot::channel();
        let run = Box::new(move || {
            let _ = tx.send(f());
        });
        let mut state = self.shard.state();
        state.seq += 1;
        let ticket = state.seq;
        state.groups[target.0].queue.push_back(Pending {
            origin: self.id,
            ticket,
            run,
        });
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "request of {} queued at {} ({} waiting)",
            self.id,
            target,
            state.groups[target.0].queue.len()
        );
        Admission::queued(rx)
    }

    /// Fails every pending request, waits for the reclaim task and
    /// detaches the group.
    pub async fn shutdown(mut self) {
        let (pending, task) = self.shard.state().begin_shutdown(self.id);
        drop(pending);
        if let Some(task) = task {
            let _ = task.await;
        }
        self.detach();
    }

    fn detach(&mut self) {
        if core::mem::replace(&mut self.detached, true) {
            return;
        }
        let (pending, task) = self.shard.state().begin_shutdown(self.id);
        if let Some(task) = task {
            task.abort();
        }
        drop(pending);
        let pending = self.shard.state().remove_group(self.id);
        drop(pending);
        self.shard.flush();
        #[cfg(feature = "tracing")]
        tracing::debug!("{} detached", self.id);
    }
}

impl Drop for RegionGroup {
    fn drop(&mut self) {
        self.detach();
    }
}
