use core::any::TypeId;
use std::collections::HashMap;

use alloc::vec::Vec;

use crate::header::OBJECT_ALIGN;

pub(crate) type MigratorId = u16;

/// Erased knowledge of how to dispose of an object.
///
/// Rust values relocate with a bitwise copy, so moving needs nothing beyond
/// the size recorded in the object header and the alignment kept here.
#[derive(Clone, Copy)]
pub(crate) struct Migrator {
    drop: Option<unsafe fn(*mut u8)>,
    align: usize,
    name: &'static str,
}

impl core::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Migrator")
            .field("name", &self.name)
            .field("align", &self.align)
            .field("drop", &self.drop.is_some())
            .finish()
    }
}

unsafe fn drop_erased<T>(ptr: *mut u8) {
    unsafe { core::ptr::drop_in_place(ptr.cast::<T>()) }
}

impl Migrator {
    const BYTES: Self = Self {
        drop: None,
        align: 1,
        name: "bytes",
    };

    fn of<T: 'static>() -> Self {
        Self {
            drop: core::mem::needs_drop::<T>().then_some(drop_erased::<T> as unsafe fn(*mut u8)),
            align: align_of::<T>(),
            name: core::any::type_name::<T>(),
        }
    }

    #[inline]
    pub fn drop_fn(&self) -> Option<unsafe fn(*mut u8)> {
        self.drop
    }

    /// Payload alignment, never below the header's.
    #[inline]
    pub fn align(&self) -> usize {
        self.align.max(OBJECT_ALIGN)
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Per-shard table of migrators, one per type ever allocated.
#[derive(Debug)]
pub(crate) struct Migrators {
    ids: HashMap<TypeId, MigratorId>,
    table: Vec<Migrator>,
}

impl Default for Migrators {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrators {
    /// Raw byte blobs.
    pub const BYTES: MigratorId = 0;

    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            table: alloc::vec![Migrator::BYTES],
        }
    }

    pub fn register<T: 'static>(&mut self) -> MigratorId {
        if let Some(id) = self.ids.get(&TypeId::of::<T>()) {
            return *id;
        }
        let id = MigratorId::try_from(self.table.len()).unwrap_or_else(|_| {
            panic!("more than {} managed types on one shard", MigratorId::MAX)
        });
        self.table.push(Migrator::of::<T>());
        self.ids.insert(TypeId::of::<T>(), id);
        #[cfg(feature = "tracing")]
        tracing::debug!("registered migrator {} for {}", id, core::any::type_name::<T>());
        id
    }

    #[inline]
    pub fn get(&self, id: MigratorId) -> &Migrator {
        &self.table[id as usize]
    }
}
