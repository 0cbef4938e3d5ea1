//! Lock-free read access to a data store

use super::buffer_table::BufferTable;
use super::entry_ref::{EntryRef, RefLayout};
use super::memory_stats::{AddressSpace, MemoryStats};
use crate::generation::GenerationGuard;
use std::sync::Arc;

/// Read handle sharing the buffer table of a [`DataStoreBase`](super::DataStoreBase)
///
/// Cheap to clone and `Send + Sync`. Statistics are always safe to read;
/// dereferencing refs requires a [`GenerationGuard`] and is `unsafe`.
#[derive(Clone, Debug)]
pub struct DataStoreReader {
    table: Arc<BufferTable>,
}

impl DataStoreReader {
    pub(crate) fn new(table: Arc<BufferTable>) -> Self {
        Self { table }
    }

    pub fn layout(&self) -> RefLayout {
        self.table.layout()
    }

    pub fn bufferid_limit(&self) -> u32 {
        self.table.bufferid_limit_acquire()
    }

    pub fn compaction_count(&self) -> u64 {
        self.table.compaction_count()
    }

    pub fn mem_stats(&self) -> MemoryStats {
        self.table.mem_stats()
    }

    pub fn address_space_usage(&self) -> AddressSpace {
        self.table.address_space_usage()
    }

    /// Dereference `entry_ref` while `guard` is held
    ///
    /// # Safety
    /// - `entry_ref` was issued by the store owning this table and made
    ///   visible to this thread through a release/acquire pair
    /// - the ref was not retired in a generation older than `guard`, nor
    ///   relocated by a finished compaction before the guard was taken
    /// - the store is still alive and does not mutate the entry in place
    /// - `T` is the element type of the ref's buffer
    pub unsafe fn get_entry<'g, T: Sync>(&'g self, guard: &'g GenerationGuard, entry_ref: EntryRef) -> &'g T {
        // SAFETY: forwarded to the caller
        unsafe { &self.get_entry_array::<T>(guard, entry_ref, 1)[0] }
    }

    /// Dereference `array_size` elements at `entry_ref` while `guard` is held
    ///
    /// # Safety
    /// Same contract as [`get_entry`](Self::get_entry), and `array_size`
    /// must not exceed the array size of the ref's type.
    pub unsafe fn get_entry_array<'g, T: Sync>(
        &'g self,
        _guard: &'g GenerationGuard,
        entry_ref: EntryRef,
        array_size: usize,
    ) -> &'g [T] {
        let layout = self.table.layout();
        let buffer_id = layout.buffer_id(entry_ref);
        // Pairs with the writer raising the limit after activating a buffer
        let limit = self.table.bufferid_limit_acquire();
        debug_assert!(buffer_id < limit, "{} beyond buffer limit {}", entry_ref, limit);
        let slot = self.table.slot(buffer_id);
        let buffer = slot.get_buffer_acquire();
        debug_assert!(!buffer.is_null(), "{} refers to a released buffer", entry_ref);
        debug_assert_eq!(slot.elem_size(), std::mem::size_of::<T>());
        debug_assert!(array_size <= slot.array_size());
        let start = layout.offset(entry_ref) * slot.array_size();
        // SAFETY: the caller guarantees the ref addresses live, initialized
        // elements of T in the published buffer
        unsafe { std::slice::from_raw_parts(buffer.cast::<T>().add(start), array_size) }
    }
}
