use core::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::task::LocalSet;

use crate::tests::{mock_shard, tracing_init};
use crate::{
    ActiveReclaimer, Error, GroupState, Limits, ManagedBytes, Reclaimed, Reclaimer, Region,
    RegionGroup, Shard, ShardConfig, Unlimited,
};

const SEG: usize = 16 * 1024;
/// Footprint of a `SEG` byte blob: a standalone mapping rounded to pages.
const BLOB: usize = SEG + 4096;

fn shard() -> Shard {
    mock_shard(ShardConfig::new().with_segment_size(SEG)).0
}

fn blob(region: &Region) -> ManagedBytes {
    region.allocate_bytes(SEG).expect("alloc ok")
}

/// Passive thresholds that count notifications.
#[derive(Default)]
struct Counting {
    soft: usize,
    hard: usize,
    started: Cell<usize>,
    stopped: Cell<usize>,
}

impl Counting {
    fn new(soft: usize, hard: usize) -> Rc<Self> {
        Rc::new(Self {
            soft,
            hard,
            ..Default::default()
        })
    }
}

impl Reclaimer for Counting {
    fn soft_limit(&self) -> usize {
        self.soft
    }

    fn hard_limit(&self) -> usize {
        self.hard
    }

    fn start_reclaiming(&self) {
        self.started.set(self.started.get() + 1);
    }

    fn stop_reclaiming(&self) {
        self.stopped.set(self.stopped.get() + 1);
    }
}

#[test]
fn memory_used_sums_subtree() {
    tracing_init();
    let shard = shard();
    let root = RegionGroup::new(&shard, Unlimited).with_name("root");
    let left = root.child(Unlimited);
    let right = root.child(Unlimited);
    let leaf = left.child(Unlimited);
    assert_eq!(leaf.parent(), Some(left.id()));
    assert_eq!(root.name().as_deref(), Some("root"));

    let r_root = Region::with_group(&root);
    let r_left = Region::with_group(&left);
    let r_right = Region::with_group(&right);
    let r_leaf = Region::with_group(&leaf);

    let _a = blob(&r_root);
    let _b: Vec<_> = (0..2000u64).map(|i| r_left.allocate(i).expect("alloc ok")).collect();
    let c = blob(&r_right);
    let _d = r_leaf.allocate_copy(b"leaf").expect("alloc ok");

    let total = |regions: &[&Region]| -> usize {
        regions.iter().map(|r| r.occupancy().total_space()).sum()
    };
    assert_eq!(leaf.memory_used(), total(&[&r_leaf]));
    assert_eq!(left.memory_used(), total(&[&r_left, &r_leaf]));
    assert_eq!(right.memory_used(), BLOB);
    assert_eq!(
        root.memory_used(),
        total(&[&r_root, &r_left, &r_right, &r_leaf])
    );
    assert_eq!(root.largest_region(), Some((r_left.id(), 3 * SEG)));

    drop(c);
    assert_eq!(right.memory_used(), 0);
    assert_eq!(root.memory_used(), total(&[&r_root, &r_left, &r_leaf]));

    // merge across groups moves the footprint between the subtrees
    let moved = r_leaf.occupancy().total_space();
    r_right.merge(&r_leaf).expect("merge ok");
    assert_eq!(leaf.memory_used(), 0);
    assert_eq!(right.memory_used(), moved);
    assert_eq!(root.memory_used(), total(&[&r_root, &r_left, &r_right]));
}

/// A closure on the root runs while only the child is full, then waits once
/// the root is over its limit too.
#[test]
fn linear_hierarchy_blocking() {
    tracing_init();
    let shard = shard();
    let a = RegionGroup::new(&shard, Limits::hard(2 * SEG));
    let b = a.child(Limits::hard(SEG));
    let ran = Rc::new(Cell::new(0));
    let run = || {
        let ran = ran.clone();
        move || ran.set(ran.get() + 1)
    };

    let first = Region::with_group(&b);
    let _x = first.allocate(1u64).expect("alloc ok");
    assert_eq!(b.memory_used(), SEG);
    assert_eq!(b.state(), GroupState::Idle);

    let mut h1 = a.run_when_memory_available(run());
    assert!(h1.is_ready());
    assert!(matches!(h1.try_take(), Some(Ok(()))));
    assert_eq!(ran.get(), 1);

    let second = Region::with_group(&b);
    let _y = blob(&second);
    assert!(b.under_pressure());
    assert!(a.under_pressure());
    assert_eq!(a.state(), GroupState::Hard);

    let mut h2 = a.run_when_memory_available(run());
    assert!(!h2.is_ready());
    assert!(h2.try_take().is_none());
    assert_eq!(a.pending(), 1);
    assert_eq!(ran.get(), 1);

    drop(second);
    assert!(!a.under_pressure());
    assert_eq!(ran.get(), 2);
    assert!(h2.is_ready());
    assert!(matches!(h2.try_take(), Some(Ok(()))));
    assert_eq!(a.pending(), 0);
}

#[tokio::test]
async fn fifo_release() {
    tracing_init();
    let shard = shard();
    let group = RegionGroup::new(&shard, Limits::hard(SEG));
    let region = Region::with_group(&group);
    let blocker = blob(&region);
    assert!(group.under_pressure());

    let counter = Rc::new(Cell::new(0));
    let handles: Vec<_> = (0..100)
        .map(|i| {
            let counter = counter.clone();
            group.run_when_memory_available(move || {
                assert_eq!(i, counter.get());
                counter.set(i + 1);
                i
            })
        })
        .collect();
    assert_eq!(group.pending(), 100);
    assert_eq!(counter.get(), 0);

    drop(blocker);
    assert_eq!(counter.get(), 100);
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(i));
    }
}

/// A request parked at a child keeps waiting while an ancestor is still
/// over its limit.
#[test]
fn cross_ancestor_pressure() {
    tracing_init();
    let shard = shard();
    let a = RegionGroup::new(&shard, Limits::hard(2 * SEG));
    let b = a.child(Limits::hard(SEG));
    let rb = Region::with_group(&b);
    let ra = Region::with_group(&a);

    let in_b = blob(&rb);
    assert!(b.under_pressure());
    assert!(!a.under_pressure());

    let ran = Rc::new(Cell::new(false));
    let mut handle = b.run_when_memory_available({
        let ran = ran.clone();
        move || ran.set(true)
    });
    assert_eq!(b.pending(), 1);

    let in_a = [blob(&ra), blob(&ra)];
    assert!(a.under_pressure());

    drop(in_b);
    assert!(!b.under_pressure());
    assert!(a.under_pressure());
    assert!(!ran.get());
    assert!(!handle.is_ready());
    assert_eq!(b.pending(), 1);

    // a request from the child now queues behind the parked one
    let order = Rc::new(RefCell::new(vec![]));
    let mut later = b.run_when_memory_available({
        let order = order.clone();
        move || order.borrow_mut().push(ran.get())
    });
    assert_eq!(b.pending(), 2);

    drop(in_a);
    assert!(handle.is_ready());
    assert!(later.is_ready());
    assert_eq!(*order.borrow(), [true]);
}

#[test]
fn soft_hard_hysteresis() {
    tracing_init();
    let shard = shard();
    let counting = Counting::new(SEG, 3 * SEG);
    let group = RegionGroup::new(&shard, counting.clone());
    let region = Region::with_group(&group);

    let mut blobs = vec![blob(&region)];
    assert_eq!(group.state(), GroupState::Soft);
    assert!(group.over_soft_limit());
    assert_eq!(counting.started.get(), 1);

    blobs.push(blob(&region));
    blobs.push(blob(&region));
    assert_eq!(group.memory_used(), 3 * BLOB);
    assert_eq!(group.state(), GroupState::Hard);
    assert_eq!(counting.started.get(), 1);

    blobs.pop();
    assert_eq!(group.state(), GroupState::Soft);
    assert_eq!(counting.stopped.get(), 0);
    blobs.pop();
    assert_eq!(group.state(), GroupState::Soft);
    assert_eq!(counting.stopped.get(), 0);

    blobs.pop();
    assert_eq!(group.state(), GroupState::Idle);
    assert_eq!((counting.started.get(), counting.stopped.get()), (1, 1));
}

/// The reclaim task of an active group evicts the biggest region first.
#[tokio::test]
async fn worst_offender_first() {
    tracing_init();
    LocalSet::new()
        .run_until(async {
            let shard = shard();
            let reclaimer = Rc::new(ActiveReclaimer::new(0, usize::MAX));
            let group = RegionGroup::new(&shard, reclaimer.clone());
            let evicted = Rc::new(RefCell::new(vec![]));

            let regions: Vec<_> = [1, 2, 3]
                .into_iter()
                .map(|segments| {
                    let region = Region::with_group(&group);
                    // 15 blobs of 1008 bytes fill one segment
                    let mut blobs: Vec<_> = (0..15 * segments)
                        .map(|_| region.allocate_bytes(1008).expect("alloc ok"))
                        .collect();
                    assert_eq!(region.occupancy().total_space(), segments * SEG);
                    let evicted = evicted.clone();
                    region.make_evictable(move || {
                        evicted.borrow_mut().push(segments);
                        blobs.clear();
                        Reclaimed::Something
                    });
                    region
                })
                .collect();
            assert_eq!(group.memory_used(), 6 * SEG);
            assert!(reclaimer.is_reclaiming());

            for _ in 0..100 {
                if group.memory_used() == 0 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(*evicted.borrow(), [3, 2, 1]);
            assert_eq!(group.state(), GroupState::Idle);
            assert!(!reclaimer.is_reclaiming());

            drop(regions);
            group.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn active_group_compacts_unevictable_regions() {
    tracing_init();
    LocalSet::new()
        .run_until(async {
            let shard = shard();
            let group = RegionGroup::new(&shard, ActiveReclaimer::new(2 * SEG, usize::MAX));
            let region = Region::with_group(&group);

            let mut objs: Vec<_> = (0..4 * 682u64)
                .map(|i| region.allocate(i).expect("alloc ok"))
                .collect();
            objs.retain(|obj| obj.with(|v| v % 4 == 0));
            // the task was spawned when the third segment went in but has
            // not run yet
            assert_eq!(group.memory_used(), 4 * SEG);

            for _ in 0..100 {
                if !group.over_soft_limit() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert!(!group.over_soft_limit());
            assert!(region.reclaim_counter() > 0);
            for (i, obj) in objs.iter().enumerate() {
                assert_eq!(obj.with(|v| *v), 4 * i as u64);
            }

            drop(objs);
            drop(region);
            group.shutdown().await;
        })
        .await;
}

/// A panicking eviction callback is dropped and the task moves on to the
/// next region instead of giving up.
#[tokio::test]
async fn panicking_callback_skipped_by_task() {
    tracing_init();
    LocalSet::new()
        .run_until(async {
            let shard = shard();
            let group = RegionGroup::new(&shard, ActiveReclaimer::new(0, usize::MAX));

            let big = Region::with_group(&group);
            let held: Rc<Vec<_>> = Rc::new(
                (0..45)
                    .map(|_| big.allocate_bytes(1008).expect("alloc ok"))
                    .collect(),
            );
            big.make_evictable({
                let held = held.clone();
                move || -> Reclaimed { panic!("callback holding {} blobs failed", held.len()) }
            });

            let small = Region::with_group(&group);
            let mut blobs: Vec<_> = (0..15)
                .map(|_| small.allocate_bytes(1008).expect("alloc ok"))
                .collect();
            let hits = Rc::new(Cell::new(0));
            small.make_evictable({
                let hits = hits.clone();
                move || {
                    hits.set(hits.get() + 1);
                    blobs.clear();
                    Reclaimed::Something
                }
            });
            assert_eq!(big.occupancy().total_space(), 3 * SEG);
            assert_eq!(small.occupancy().total_space(), SEG);

            for _ in 0..100 {
                if small.occupancy().total_space() == 0 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert!(hits.get() > 0);
            assert_eq!(small.occupancy().total_space(), 0);
            assert!(!big.is_evictable());
            assert_eq!(big.occupancy().total_space(), 3 * SEG);
            assert!(shard.stats().failed_evictions >= 1);
            assert!(shard.stats().evictions >= 1);

            drop(held);
            drop((big, small));
            group.shutdown().await;
        })
        .await;
}

#[test]
fn active_group_without_runtime() {
    tracing_init();
    let shard = shard();
    let group = RegionGroup::new(&shard, ActiveReclaimer::new(0, usize::MAX));
    let region = Region::with_group(&group);

    // no runtime to spawn on, so reclaim is skipped rather than panicking
    let obj = region.allocate(5u64).expect("alloc ok");
    group.update(SEG as isize);
    assert!(group.over_soft_limit());
    assert_eq!(group.memory_used(), 2 * SEG);
    assert_eq!(obj.with(|v| *v), 5);
}

#[tokio::test]
async fn active_group_outside_local_set() {
    tracing_init();
    let shard = shard();
    let group = RegionGroup::new(&shard, ActiveReclaimer::new(0, usize::MAX));
    group.update(SEG as isize);
    assert!(group.over_soft_limit());

    // a later charge inside a local set gets its task
    LocalSet::new()
        .run_until(async {
            group.update(SEG as isize);
            assert_eq!(group.memory_used(), 2 * SEG);
            group.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn shutdown_fails_pending() {
    tracing_init();
    LocalSet::new()
        .run_until(async {
            let shard = shard();
            let root = RegionGroup::new(&shard, Limits::hard(SEG));
            let child = root.child(Unlimited);
            let group = RegionGroup::new(&shard, Limits::hard(SEG));

            root.update(2 * SEG as isize);
            group.update(2 * SEG as isize);
            assert!(root.under_pressure() && group.under_pressure());

            let ran = Rc::new(Cell::new(0));
            let run = || {
                let ran = ran.clone();
                move || ran.set(ran.get() + 1)
            };
            let h1 = group.run_when_memory_available(run());
            let h2 = group.run_when_memory_available(run());
            // parked on the parent's queue on behalf of the child
            let h3 = child.run_when_memory_available(run());
            let h4 = root.run_when_memory_available(run());
            assert_eq!(root.pending(), 2);

            group.shutdown().await;
            child.shutdown().await;
            assert_eq!(h1.await, Err(Error::GroupShutdown));
            assert_eq!(h2.await, Err(Error::GroupShutdown));
            assert_eq!(h3.await, Err(Error::GroupShutdown));
            assert_eq!(root.pending(), 1);

            root.update(-(2 * SEG as isize));
            assert_eq!(h4.await, Ok(()));
            assert_eq!(ran.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn shutdown_waits_for_reclaim_task() {
    tracing_init();
    LocalSet::new()
        .run_until(async {
            let shard = shard();
            let group = RegionGroup::new(&shard, ActiveReclaimer::new(0, usize::MAX));
            group.update(SEG as isize);
            assert!(group.over_soft_limit());
            group.shutdown().await;
            assert_eq!(shard.state_ref().groups.len(), 0);
        })
        .await;
}

#[test]
fn update_predeclares_usage() {
    let shard = shard();
    let group = RegionGroup::new(&shard, Limits::new(SEG / 2, SEG));
    group.update(SEG as isize + 1);
    assert_eq!(group.state(), GroupState::Hard);
    let mut handle = group.run_when_memory_available(|| 42);
    assert!(!handle.is_ready());

    group.update(-1);
    assert_eq!(group.memory_used(), SEG);
    assert!(matches!(handle.try_take(), Some(Ok(42))));
    assert_eq!(group.state(), GroupState::Soft);
}

#[test]
fn merge_decrements_before_charging() {
    tracing_init();
    let shard = shard();
    let counting = Counting::new(3 * SEG, 3 * SEG);
    let root = RegionGroup::new(&shard, counting.clone());
    let from = root.child(Limits::hard(SEG));
    let to = root.child(Unlimited);

    let src = Region::with_group(&from);
    let dst = Region::with_group(&to);
    let _objs: Vec<_> = (0..2 * 682u64)
        .map(|i| src.allocate(i).expect("alloc ok"))
        .collect();
    let _other = dst.allocate(0u64).expect("alloc ok");
    assert_eq!(root.memory_used(), 3 * SEG);
    assert!(from.under_pressure());

    let ran = Rc::new(Cell::new(false));
    let mut handle = from.run_when_memory_available({
        let ran = ran.clone();
        move || ran.set(true)
    });
    assert!(!handle.is_ready());

    dst.merge(&src).expect("merge ok");
    assert!(ran.get());
    assert!(handle.is_ready());
    assert_eq!(from.memory_used(), 0);
    assert_eq!(to.memory_used(), 3 * SEG);
    assert_eq!(root.memory_used(), 3 * SEG);
    // the root never saw the sum of both sides
    assert_eq!(counting.started.get(), 0);
}

#[test]
fn dropped_child_releases_parent() {
    let shard = shard();
    let parent = RegionGroup::new(&shard, Limits::hard(SEG));
    let child = parent.child(Unlimited);
    child.update(2 * SEG as isize);
    assert!(parent.under_pressure());

    let mut handle = parent.run_when_memory_available(|| "done");
    assert!(!handle.is_ready());

    drop(child);
    assert_eq!(parent.memory_used(), 0);
    assert!(matches!(handle.try_take(), Some(Ok("done"))));
}
