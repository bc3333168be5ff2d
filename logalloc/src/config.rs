use bytesize::ByteSize;

/// What the tracker does with an eviction callback that reported
/// [`Reclaimed::Nothing`](crate::Reclaimed::Nothing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NothingReclaimed {
    /// Keep the callback, but rank the region after every other candidate
    /// until it grows again.
    #[default]
    Demote,
    /// Drop the callback; the region is no longer evictable.
    Deregister,
}

#[derive(Clone, Copy, Debug)]
pub struct ShardConfig {
    pub(crate) segment_size: usize,
    pub(crate) memory_limit: usize,
    pub(crate) emergency_reserve: usize,
    pub(crate) free_segment_cache: usize,
    pub(crate) large_object_ratio: usize,
    pub(crate) nothing_reclaimed: NothingReclaimed,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ShardConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "segment {} limit {} reserve {} cache {} large 1/{} ({:?})",
            ByteSize::b(self.segment_size as u64),
            ByteSize::b(self.memory_limit as u64),
            self.emergency_reserve,
            self.free_segment_cache,
            self.large_object_ratio,
            self.nothing_reclaimed,
        )
    }
}

impl ShardConfig {
    pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024;
    pub const MIN_SEGMENT_SIZE: usize = 4 * 1024;
    pub const DEFAULT_MEMORY_LIMIT: usize = 1 << 30;

    pub const fn new() -> Self {
        Self {
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
            memory_limit: Self::DEFAULT_MEMORY_LIMIT,
            emergency_reserve: 2,
            free_segment_cache: 16,
            large_object_ratio: 4,
            nothing_reclaimed: NothingReclaimed::Demote,
        }
    }

    pub const fn with_segment_size(self, segment_size: usize) -> Self {
        Self {
            segment_size,
            ..self
        }
    }

    pub const fn with_memory_limit(self, memory_limit: usize) -> Self {
        Self {
            memory_limit,
            ..self
        }
    }

    pub const fn with_emergency_reserve(self, emergency_reserve: usize) -> Self {
        Self {
            emergency_reserve,
            ..self
        }
    }

    pub const fn with_free_segment_cache(self, free_segment_cache: usize) -> Self {
        Self {
            free_segment_cache,
            ..self
        }
    }

    pub const fn with_large_object_ratio(self, large_object_ratio: usize) -> Self {
        Self {
            large_object_ratio,
            ..self
        }
    }

    pub const fn with_nothing_reclaimed(self, nothing_reclaimed: NothingReclaimed) -> Self {
        Self {
            nothing_reclaimed,
            ..self
        }
    }

    /// Brings out-of-range values back into the supported domain.
    pub const fn validate(self) -> Self {
        let mut segment_size = self.segment_size;
        if segment_size < Self::MIN_SEGMENT_SIZE {
            segment_size = Self::MIN_SEGMENT_SIZE;
        }
        segment_size = segment_size.next_power_of_two();

        let large_object_ratio = if self.large_object_ratio < 2 {
            2
        } else {
            self.large_object_ratio
        };

        Self {
            segment_size,
            large_object_ratio,
            ..self
        }
    }

    #[inline]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    #[inline]
    pub const fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    #[inline]
    pub const fn emergency_reserve(&self) -> usize {
        self.emergency_reserve
    }

    #[inline]
    pub const fn free_segment_cache(&self) -> usize {
        self.free_segment_cache
    }

    #[inline]
    pub const fn nothing_reclaimed(&self) -> NothingReclaimed {
        self.nothing_reclaimed
    }

    /// Payloads larger than this bypass the segment pool.
    #[inline]
    pub const fn large_object_threshold(&self) -> usize {
        self.segment_size / self.large_object_ratio
    }

    /// Bytes ordinary allocations may keep mapped; the rest is held back for
    /// compaction destinations.
    #[inline]
    pub const fn allocation_limit(&self) -> usize {
        self.memory_limit
            .saturating_sub(self.emergency_reserve * self.segment_size)
    }
}

#[cfg(test)]
mod tests {
    use super::ShardConfig;

    #[test]
    fn validate_rounds_segment_size() {
        let conf = ShardConfig::new().with_segment_size(100_000).validate();
        assert_eq!(conf.segment_size(), 128 * 1024);

        let conf = ShardConfig::new().with_segment_size(1).validate();
        assert_eq!(conf.segment_size(), ShardConfig::MIN_SEGMENT_SIZE);
    }

    #[test]
    fn reserve_is_held_back() {
        let conf = ShardConfig::new()
            .with_memory_limit(16 * ShardConfig::DEFAULT_SEGMENT_SIZE)
            .with_emergency_reserve(2);
        assert_eq!(
            conf.allocation_limit(),
            14 * ShardConfig::DEFAULT_SEGMENT_SIZE
        );
        assert_eq!(conf.large_object_threshold(), 32 * 1024);
    }
}
