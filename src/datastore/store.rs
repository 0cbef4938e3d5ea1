//! Single-type data store

use super::allocator::{Allocator, FreeListAllocator};
use super::base::DataStoreBase;
use super::buffer_type::BufferType;
use super::compaction::{CompactingBuffers, CompactionSpec, CompactionStrategy};
use super::entry_ref::{EntryRef, RefLayout};
use super::memory_stats::{AddressSpace, MemoryStats, MemoryUsage};
use super::reader::DataStoreReader;
use crate::config::DataStoreConfig;
use crate::error::Result;
use crate::generation::{Generation, GenerationHandler};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Default minimum number of arrays in a new buffer
pub const DEFAULT_MIN_ARRAYS: usize = 1024;

/// Data store holding one entry type with one element per entry
///
/// ```
/// use photondb_datastore::{DataStore, GenerationHandler};
///
/// let mut store = DataStore::<u64>::new();
/// let generations = GenerationHandler::new();
///
/// let r = store.add_entry(42);
/// assert_eq!(*store.get_entry(r), 42);
///
/// store.hold_entry(r);
/// store.commit(&generations);
/// ```
pub struct DataStore<T> {
    base: DataStoreBase,
    type_id: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DataStore<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_min_arrays(DEFAULT_MIN_ARRAYS)
    }

    /// Store with the default layout and buffers of at least `min_arrays` entries
    pub fn with_min_arrays(min_arrays: usize) -> Self {
        let layout = RefLayout::default();
        let base = match DataStoreBase::new(layout, layout.num_buffers(), layout.offset_size()) {
            Ok(base) => base,
            Err(e) => unreachable!("default layout is valid: {}", e),
        };
        Self::from_base(base, min_arrays, true)
    }

    pub fn with_config(config: &DataStoreConfig) -> Result<Self> {
        let base = DataStoreBase::from_config(config)?;
        Ok(Self::from_base(base, config.min_arrays, config.enable_free_lists))
    }

    fn from_base(mut base: DataStoreBase, min_arrays: usize, enable_free_lists: bool) -> Self {
        let max_arrays = base.layout().offset_size();
        let type_id = base.add_type(Arc::new(BufferType::<T>::new(1, min_arrays, max_arrays)));
        base.init_primary_buffers();
        if enable_free_lists {
            base.enable_free_lists();
        }
        Self {
            base,
            type_id,
            _marker: PhantomData,
        }
    }

    pub fn base(&self) -> &DataStoreBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut DataStoreBase {
        &mut self.base
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn allocator(&mut self) -> Allocator<'_, T> {
        Allocator::new(&mut self.base, self.type_id)
    }

    pub fn free_list_allocator(&mut self) -> FreeListAllocator<'_, T> {
        FreeListAllocator::new(&mut self.base, self.type_id)
    }

    /// Store `value`, reusing a reclaimed entry when free lists are enabled
    pub fn add_entry(&mut self, value: T) -> EntryRef {
        if self.base.free_lists_enabled() {
            self.free_list_allocator().alloc(value).entry_ref
        } else {
            self.allocator().alloc(value).entry_ref
        }
    }

    pub fn get_entry(&self, entry_ref: EntryRef) -> &T {
        self.base.get_entry(entry_ref)
    }

    /// Mutable access for entries no reader can observe yet
    pub fn get_entry_mut(&mut self, entry_ref: EntryRef) -> &mut T {
        self.base.get_entry_mut(entry_ref)
    }

    /// Retire an entry; it is reused after its generation is reclaimed
    pub fn hold_entry(&mut self, entry_ref: EntryRef) {
        self.base.hold_elem(entry_ref, 1);
    }

    /// Copy an entry out of a compacting buffer, returning its new ref
    pub fn move_on_compact(&mut self, entry_ref: EntryRef) -> EntryRef {
        let value = self.base.get_entry::<T>(entry_ref).clone();
        self.allocator().alloc(value).entry_ref
    }

    pub fn start_compact(&mut self, spec: CompactionSpec, strategy: &CompactionStrategy) -> CompactingBuffers {
        self.base.start_compact_worst_buffers(spec, strategy)
    }

    pub fn finish_compact(&mut self, compacting: CompactingBuffers) {
        self.base.finish_compact(compacting);
    }

    /// Compact the worst buffers when every live ref is in `refs`
    ///
    /// Refs into compacted buffers are rewritten in place. Returns the number
    /// of moved entries.
    pub fn compact_worst(
        &mut self,
        spec: CompactionSpec,
        strategy: &CompactionStrategy,
        refs: &mut [EntryRef],
    ) -> usize {
        let compacting = self.start_compact(spec, strategy);
        if compacting.is_empty() {
            self.finish_compact(compacting);
            return 0;
        }
        let mut moved = 0;
        for entry_ref in refs.iter_mut() {
            if compacting.has(*entry_ref) {
                *entry_ref = self.move_on_compact(*entry_ref);
                moved += 1;
            }
        }
        debug!(moved, buffers = ?compacting.buffer_ids(), "relocated entries");
        self.finish_compact(compacting);
        moved
    }

    pub fn assign_generation(&mut self, generation: Generation) {
        self.base.assign_generation(generation);
    }

    pub fn reclaim_memory(&mut self, oldest_used: Generation) {
        self.base.reclaim_memory(oldest_used);
    }

    pub fn reclaim_all_memory(&mut self) {
        self.base.reclaim_all_memory();
    }

    pub fn commit(&mut self, handler: &GenerationHandler) -> Generation {
        self.base.commit(handler)
    }

    pub fn reader(&self) -> DataStoreReader {
        self.base.reader()
    }

    pub fn mem_stats(&self) -> MemoryStats {
        self.base.mem_stats()
    }

    pub fn address_space_usage(&self) -> AddressSpace {
        self.base.address_space_usage()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.base.memory_usage()
    }
}

impl<T> Default for DataStore<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
