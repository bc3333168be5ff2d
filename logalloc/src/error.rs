use bytesize::ByteSize;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    /// A region cannot absorb itself.
    SameRegion,
    /// The regions live on different shards.
    CrossShard,
    /// One of the regions is under a reclaim lock.
    ReclaimLocked,
}

/// Failure reported by a [`Backend`](crate::os::Backend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    InvalidLayout { size: usize, align: usize },
    Exhausted { size: usize },
    #[cfg(feature = "unix")]
    Os(nix::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    OutOfMemory {
        /// The requested size
        requested: usize,
        /// Bytes the shard may still map
        available: usize,
    },
    GroupShutdown,
    InvalidMerge(MergeError),
    Unsupported {
        size: usize,
        align: usize,
    },
    Backend(BackendError),
}

impl core::fmt::Display for MergeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SameRegion => write!(f, "region merged into itself"),
            Self::CrossShard => write!(f, "regions belong to different shards"),
            Self::ReclaimLocked => write!(f, "region is under a reclaim lock"),
        }
    }
}

impl core::fmt::Display for BackendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidLayout { size, align } => {
                write!(f, "Invalid mapping layout: size {}, align {}", size, align)
            }
            Self::Exhausted { size } => write!(f, "Host refused {}", ByteSize::b(*size as u64)),
            #[cfg(feature = "unix")]
            Self::Os(err) => write!(f, "Mapping error: {}", err),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "Allocation failed: requested {}, but only {} is available",
                ByteSize::b(*requested as u64),
                ByteSize::b(*available as u64)
            ),
            Self::GroupShutdown => write!(f, "Region group was shut down"),
            Self::InvalidMerge(reason) => write!(f, "Invalid merge: {}", reason),
            Self::Unsupported { size, align } => write!(
                f,
                "Unsupported object layout: size {}, align {}",
                size, align
            ),
            Self::Backend(err) => write!(f, "Backend error: {}", err),
        }
    }
}

impl core::error::Error for MergeError {}
impl core::error::Error for BackendError {}
impl core::error::Error for Error {}

impl From<MergeError> for Error {
    fn from(value: MergeError) -> Self {
        Self::InvalidMerge(value)
    }
}

impl From<BackendError> for Error {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

#[cfg(feature = "unix")]
impl From<nix::Error> for BackendError {
    fn from(value: nix::Error) -> Self {
        Self::Os(value)
    }
}
