//! A log-structured allocator for movable objects.
//!
//! Objects live in fixed-size segments owned by [`Region`]s and are
//! reached through [`Managed`] handles, so compaction can relocate them and
//! hand whole segments back to the host. Regions may be charged to a tree
//! of [`RegionGroup`]s whose thresholds gate admission of new work and
//! drive eviction.
//!
//! Every type here is bound to one [`Shard`], which is single-threaded.

extern crate alloc;

#[cfg(feature = "tracing")]
extern crate tracing;

mod config;
mod error;
mod group;
mod header;
mod managed;
mod migrator;
pub mod os;
mod region;
mod segment;
mod shard;
mod stats;

pub use config::{NothingReclaimed, ShardConfig};
pub use error::{BackendError, Error, MergeError, Result};
pub use group::{
    ActiveReclaimer, Admission, GroupId, GroupState, Limits, Reclaimer, RegionGroup, Unlimited,
};
pub use managed::{Managed, ManagedBytes};
pub use os::{Backend, HeapBackend};
pub use region::{MAX_ALIGN, Occupancy, ReclaimLock, Reclaimed, Region, RegionId};
pub use shard::Shard;
pub use stats::Stats;
