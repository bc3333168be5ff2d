macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        paste::paste! {
            /// Monotonic per-shard counters.
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
            pub struct Stats {
                $(
                    $(#[$doc])*
                    pub $name: u64,
                )*
            }

            impl Stats {
                $(
                    #[inline]
                    pub(crate) fn [<add_ $name>](&mut self, n: usize) {
                        self.$name += n as u64;
                    }
                )*
            }

            impl core::fmt::Display for Stats {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    let mut s = f.debug_map();
                    $( s.entry(&stringify!($name), &self.$name); )*
                    s.finish()
                }
            }
        }
    };
}

counters! {
    segments_mapped,
    segments_unmapped,
    /// Standalone mappings for over-sized objects.
    large_mapped,
    large_unmapped,
    segments_compacted,
    objects_migrated,
    bytes_migrated,
    evictions,
    /// Callbacks that reported nothing or panicked.
    failed_evictions,
    allocation_failures,
    reclaims,
    bytes_reclaimed,
}
