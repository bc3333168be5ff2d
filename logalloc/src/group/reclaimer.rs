use core::cell::Cell;

/// Policy attached to a region group.
///
/// The hooks are called synchronously from accounting and must neither
/// block nor panic.
pub trait Reclaimer {
    /// `memory_used` above this starts reclaim.
    fn soft_limit(&self) -> usize;

    /// `memory_used` above this blocks admission.
    fn hard_limit(&self) -> usize;

    /// The group went over its soft limit.
    fn start_reclaiming(&self) {}

    /// The group fell back to or below its soft limit.
    fn stop_reclaiming(&self) {}

    /// Whether the group runs its own eviction task while over the soft
    /// limit. Active groups need a tokio `LocalSet`.
    fn active(&self) -> bool {
        false
    }
}

/// Passive thresholds: admission control only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    soft: usize,
    hard: usize,
}

impl Limits {
    pub const fn new(soft: usize, hard: usize) -> Self {
        debug_assert!(soft <= hard);
        Self { soft, hard }
    }

    /// Soft and hard limit at the same threshold.
    pub const fn hard(hard: usize) -> Self {
        Self::new(hard, hard)
    }
}

impl Reclaimer for Limits {
    fn soft_limit(&self) -> usize {
        self.soft
    }

    fn hard_limit(&self) -> usize {
        self.hard
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Reclaimer for Unlimited {
    fn soft_limit(&self) -> usize {
        usize::MAX
    }

    fn hard_limit(&self) -> usize {
        usize::MAX
    }
}

/// Thresholds plus a reclaim task that evicts the largest region of the
/// subtree until the group is back under its soft limit.
#[derive(Debug)]
pub struct ActiveReclaimer {
    limits: Limits,
    reclaiming: Cell<bool>,
}

impl ActiveReclaimer {
    pub const fn new(soft: usize, hard: usize) -> Self {
        Self {
            limits: Limits::new(soft, hard),
            reclaiming: Cell::new(false),
        }
    }

    /// Between a start and the matching stop notification.
    #[inline]
    pub fn is_reclaiming(&self) -> bool {
        self.reclaiming.get()
    }
}

impl Reclaimer for ActiveReclaimer {
    fn soft_limit(&self) -> usize {
        self.limits.soft
    }

    fn hard_limit(&self) -> usize {
        self.limits.hard
    }

    fn start_reclaiming(&self) {
        self.reclaiming.set(true);
    }

    fn stop_reclaiming(&self) {
        self.reclaiming.set(false);
    }

    fn active(&self) -> bool {
        true
    }
}

impl<R: Reclaimer + ?Sized> Reclaimer for std::rc::Rc<R> {
    fn soft_limit(&self) -> usize {
        (**self).soft_limit()
    }

    fn hard_limit(&self) -> usize {
        (**self).hard_limit()
    }

    fn start_reclaiming(&self) {
        (**self).start_reclaiming()
    }

    fn stop_reclaiming(&self) {
        (**self).stop_reclaiming()
    }

    fn active(&self) -> bool {
        (**self).active()
    }
}
