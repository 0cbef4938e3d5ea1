//! Untyped data store orchestrating buffers, types and generations

use super::buffer_state::{BufferState, BufferStatus, FallbackHold};
use super::buffer_table::BufferTable;
use super::buffer_type::{BufferCounts, BufferTypeBase, GrowthPolicy};
use super::compaction::{CompactBufferCandidates, CompactingBuffers, CompactionSpec, CompactionStrategy};
use super::entry_ref::{EntryRef, RefLayout};
use super::free_list::FreeList;
use super::memory_stats::{AddressSpace, BufferStatsSnapshot, MemoryStats, MemoryUsage};
use super::reader::DataStoreReader;
use crate::config::DataStoreConfig;
use crate::error::{Error, Result};
use crate::generation::{Generation, GenerationHandler, GenerationHoldList, HeldBytes};
use std::any::TypeId;
use std::mem;
use std::sync::Arc;
use tracing::{debug, info};

/// Dead bytes in a primary buffer before it is considered too dead to keep
/// filling during compaction
const TOO_DEAD_SLACK: usize = 0x4000;

/// Active buffers a type needs before an older one is resumed instead of
/// switching to a fresh buffer
const MIN_ACTIVE_BUFFERS: usize = 4;

/// Entries retired with [`DataStoreBase::hold_elem`]
#[derive(Debug, Clone, Copy)]
struct EntryRefHoldElem {
    entry_ref: EntryRef,
    num_elems: usize,
}

impl HeldBytes for EntryRefHoldElem {
    // Accounted through the buffer hold counters
    fn byte_size(&self) -> usize {
        0
    }
}

/// Memory waiting on the generation holder
enum HeldResource {
    Buffer(u32),
    Fallback(FallbackHold),
}

impl HeldBytes for HeldResource {
    fn byte_size(&self) -> usize {
        match self {
            // Held buffers are still counted by their own stats
            HeldResource::Buffer(_) => 0,
            HeldResource::Fallback(hold) => hold.byte_size(),
        }
    }
}

struct TypeState {
    /// Element hooks and geometry
    handler: Arc<dyn BufferTypeBase>,
    /// Growth policy clamped to the store's `max_arrays`
    policy: GrowthPolicy,
    /// Buffer new entries are appended to; `None` until initialized
    primary_buffer_id: Option<u32>,
    /// Active buffers of this type, in activation order
    active_buffers: Vec<u32>,
    /// Buffers of this type with reusable entries
    free_list: FreeList,
}

/// Generation-aware arena of typed buffers
///
/// Owned by the single writer; every mutation takes `&mut self`. Readers get
/// a [`DataStoreReader`] sharing the buffer table.
pub struct DataStoreBase {
    /// Slots shared with readers
    table: Arc<BufferTable>,
    /// Writer-side state per buffer id below the limit
    states: Vec<BufferState>,
    /// Registered types, indexed by type id
    types: Vec<TypeState>,
    /// Retired entries waiting for their generation
    entry_ref_hold_list: GenerationHoldList<EntryRefHoldElem>,
    /// Retired buffers and replaced allocations waiting for their generation
    gen_holder: GenerationHoldList<HeldResource>,
    /// Buffers currently on hold
    hold_buffer_count: u32,
    /// Newly activated buffers get a free list
    free_lists_enabled: bool,
    /// Newly activated buffers mark retired elements dead at once
    disable_elem_hold_list: bool,
    /// Replaced allocations are freed at once
    initializing: bool,
}

impl std::fmt::Debug for DataStoreBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStoreBase")
            .field("layout", &self.table.layout())
            .field("bufferid_limit", &self.bufferid_limit())
            .field("types", &self.types.len())
            .field("hold_buffer_count", &self.hold_buffer_count)
            .finish()
    }
}

impl DataStoreBase {
    /// Create an empty store with `num_buffers` buffer slots of up to
    /// `max_arrays` arrays each
    pub fn new(layout: RefLayout, num_buffers: u32, max_arrays: usize) -> Result<Self> {
        if num_buffers == 0 || num_buffers > layout.num_buffers() {
            return Err(Error::InvalidArgument(format!(
                "num_buffers must be in 1..={}, got {}",
                layout.num_buffers(),
                num_buffers
            )));
        }
        if max_arrays == 0 || max_arrays > layout.offset_size() {
            return Err(Error::InvalidArgument(format!(
                "max_arrays must be in 1..={}, got {}",
                layout.offset_size(),
                max_arrays
            )));
        }
        Ok(Self {
            table: Arc::new(BufferTable::new(num_buffers, layout, max_arrays)),
            states: Vec::new(),
            types: Vec::new(),
            entry_ref_hold_list: GenerationHoldList::new(),
            gen_holder: GenerationHoldList::new(),
            hold_buffer_count: 0,
            free_lists_enabled: false,
            disable_elem_hold_list: false,
            initializing: false,
        })
    }

    pub fn from_config(config: &DataStoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = RefLayout::new(config.offset_bits)?;
        Self::new(layout, config.effective_num_buffers(), config.effective_max_arrays())
    }

    /// Register a type handler, returning its type id
    pub fn add_type(&mut self, handler: Arc<dyn BufferTypeBase>) -> u32 {
        let type_id = self.types.len() as u32;
        let policy = handler.policy().clamp_max_arrays(self.table.max_arrays());
        debug!(
            type_id,
            elem_size = handler.elem_size(),
            array_size = handler.array_size(),
            max_arrays = policy.max_arrays,
            "registered buffer type"
        );
        self.types.push(TypeState {
            handler,
            policy,
            primary_buffer_id: None,
            active_buffers: Vec::new(),
            free_list: FreeList::new(),
        });
        type_id
    }

    /// Allocate a primary buffer for every registered type still without one
    pub fn init_primary_buffers(&mut self) {
        for type_id in 0..self.types.len() as u32 {
            if self.types[type_id as usize].primary_buffer_id.is_none() {
                self.switch_primary_buffer(type_id, 0);
            }
        }
    }

    pub fn layout(&self) -> RefLayout {
        self.table.layout()
    }

    pub fn reader(&self) -> DataStoreReader {
        DataStoreReader::new(Arc::clone(&self.table))
    }

    pub fn num_types(&self) -> u32 {
        self.types.len() as u32
    }

    pub fn primary_buffer_id(&self, type_id: u32) -> u32 {
        match self.types[type_id as usize].primary_buffer_id {
            Some(buffer_id) => buffer_id,
            None => panic!("type {} has no primary buffer; call init_primary_buffers", type_id),
        }
    }

    pub fn buffer_status(&self, buffer_id: u32) -> BufferStatus {
        self.states
            .get(buffer_id as usize)
            .map_or(BufferStatus::Free, BufferState::status)
    }

    pub fn buffer_state(&self, buffer_id: u32) -> &BufferState {
        &self.states[buffer_id as usize]
    }

    pub fn buffer_stats(&self, buffer_id: u32) -> BufferStatsSnapshot {
        self.table.slot(buffer_id).stats.snapshot()
    }

    /// Type id of the handler registered for element type `T`, if any
    pub fn type_id_of<T: 'static>(&self) -> Option<u32> {
        let wanted = TypeId::of::<T>();
        self.types
            .iter()
            .position(|t| t.handler.elem_type() == wanted)
            .map(|pos| pos as u32)
    }

    pub fn type_handler(&self, type_id: u32) -> &Arc<dyn BufferTypeBase> {
        &self.types[type_id as usize].handler
    }

    pub fn bufferid_limit(&self) -> u32 {
        self.table.bufferid_limit_relaxed()
    }

    pub fn max_num_buffers(&self) -> u32 {
        self.table.max_num_buffers()
    }

    pub fn active_buffers(&self, type_id: u32) -> &[u32] {
        &self.types[type_id as usize].active_buffers
    }

    pub fn for_each_active_buffer<F>(&self, mut f: F)
    where
        F: FnMut(u32, &BufferState),
    {
        for (buffer_id, state) in self.states.iter().enumerate() {
            if state.is_active() {
                f(buffer_id as u32, state);
            }
        }
    }

    pub fn has_held_buffers(&self) -> bool {
        self.hold_buffer_count > 0
    }

    pub fn hold_buffer_count(&self) -> u32 {
        self.hold_buffer_count
    }

    pub fn compaction_count(&self) -> u64 {
        self.table.compaction_count()
    }

    pub fn free_lists_enabled(&self) -> bool {
        self.free_lists_enabled
    }

    /// Make room for `elems_needed` more elements in the primary buffer of `type_id`
    #[inline]
    pub fn ensure_buffer_capacity(&mut self, type_id: u32, elems_needed: usize) {
        let buffer_id = self.primary_buffer_id(type_id);
        if elems_needed > self.table.slot(buffer_id).stats.remaining() {
            self.switch_or_grow_primary_buffer(type_id, elems_needed);
        }
    }

    fn switch_or_grow_primary_buffer(&mut self, type_id: u32, elems_needed: usize) {
        let type_state = &self.types[type_id as usize];
        let array_size = type_state.handler.array_size();
        let threshold = type_state
            .policy
            .scaled_num_arrays_for_new_buffer(type_state.active_buffers.len())
            * array_size;
        let buffer_id = self.primary_buffer_id(type_id);
        let used = self.table.slot(buffer_id).stats.size();
        if elems_needed + used >= threshold {
            if self.consider_grow_active_buffer(type_id, elems_needed) {
                let buffer_id = self.primary_buffer_id(type_id);
                if elems_needed > self.table.slot(buffer_id).stats.remaining() {
                    self.fallback_resize(buffer_id, elems_needed);
                }
            } else {
                self.switch_primary_buffer(type_id, elems_needed);
            }
        } else {
            self.fallback_resize(buffer_id, elems_needed);
        }
    }

    /// Resume the least used active buffer of a type with many active buffers
    fn consider_grow_active_buffer(&mut self, type_id: u32, elems_needed: usize) -> bool {
        let type_state = &self.types[type_id as usize];
        if type_state.active_buffers.len() < MIN_ACTIVE_BUFFERS
            || type_state.policy.num_arrays_for_new_buffer == 0
        {
            return false;
        }
        let buffer_id = self.primary_buffer_id(type_id);
        assert!(!self.states[buffer_id as usize].compacting());
        let mut min_buffer_id = buffer_id;
        let mut min_used = self.table.slot(buffer_id).stats.size();
        let mut checked = 1;
        for &alt_id in &type_state.active_buffers {
            if alt_id != buffer_id && !self.states[alt_id as usize].compacting() {
                checked += 1;
                let used = self.table.slot(alt_id).stats.size();
                if used < min_used {
                    min_buffer_id = alt_id;
                    min_used = used;
                }
            }
        }
        if checked < MIN_ACTIVE_BUFFERS {
            return false;
        }
        let array_size = type_state.handler.array_size();
        if elems_needed + min_used > type_state.policy.max_arrays * array_size {
            return false;
        }
        if min_buffer_id != buffer_id {
            debug!(type_id, from = buffer_id, to = min_buffer_id, "resumed active buffer as primary");
            self.types[type_id as usize].primary_buffer_id = Some(min_buffer_id);
        }
        true
    }

    /// Move the primary buffer of `type_id` to a free buffer
    pub fn switch_primary_buffer(&mut self, type_id: u32, elems_needed: usize) {
        let buffer_id = self.first_free_buffer_id();
        if buffer_id >= self.max_num_buffers() {
            panic!(
                "switch_primary_buffer({}, {}): no free buffer among {}",
                type_id,
                elems_needed,
                self.max_num_buffers()
            );
        }
        self.on_active(buffer_id, type_id, elems_needed);
        let previous = self.types[type_id as usize].primary_buffer_id.replace(buffer_id);
        debug!(type_id, buffer_id, ?previous, elems_needed, "switched primary buffer");
    }

    fn first_free_buffer_id(&self) -> u32 {
        self.states
            .iter()
            .position(BufferState::is_free)
            .unwrap_or(self.states.len()) as u32
    }

    fn type_counts(&self, type_id: u32) -> BufferCounts {
        let mut counts = BufferCounts::default();
        for &buffer_id in &self.types[type_id as usize].active_buffers {
            let stats = &self.table.slot(buffer_id).stats;
            counts.used_elems += stats.size();
            counts.dead_elems += stats.dead_elems();
        }
        counts
    }

    fn on_active(&mut self, buffer_id: u32, type_id: u32, elems_needed: usize) {
        assert!((type_id as usize) < self.types.len(), "unknown type {}", type_id);
        assert!(buffer_id as usize <= self.states.len());
        let grows_limit = buffer_id as usize == self.states.len();
        if grows_limit {
            self.states.push(BufferState::new(buffer_id));
        }

        let counts = self.type_counts(type_id);
        let type_state = &self.types[type_id as usize];
        let handler = Arc::clone(&type_state.handler);
        let array_size = handler.array_size();
        let previous_arrays = type_state
            .primary_buffer_id
            .map_or(0, |id| self.table.slot(id).stats.capacity() / array_size);
        let arrays = type_state.policy.calc_arrays_to_alloc(
            array_size,
            handler.reserved_elements(buffer_id),
            elems_needed,
            None,
            counts,
            previous_arrays,
        );

        let slot = self.table.slot(buffer_id);
        let state = &mut self.states[buffer_id as usize];
        state.on_active(buffer_id, type_id, handler, arrays, self.disable_elem_hold_list, slot);
        if self.free_lists_enabled {
            state.enable_free_list();
        }
        self.types[type_id as usize].active_buffers.push(buffer_id);
        if grows_limit {
            self.table.set_bufferid_limit(buffer_id + 1);
        }
        debug!(buffer_id, type_id, arrays, "activated buffer");
    }

    fn fallback_resize(&mut self, buffer_id: u32, elems_needed: usize) {
        let type_id = self.states[buffer_id as usize].type_id();
        let counts = self.type_counts(type_id);
        let type_state = &self.types[type_id as usize];
        let array_size = type_state.handler.array_size();
        let stats = &self.table.slot(buffer_id).stats;
        let used = stats.size();
        let arrays = type_state.policy.calc_arrays_to_alloc(
            array_size,
            type_state.handler.reserved_elements(buffer_id),
            elems_needed,
            Some(used),
            counts,
            stats.capacity() / array_size,
        );

        let slot = self.table.slot(buffer_id);
        let hold = self.states[buffer_id as usize].fallback_resize(buffer_id, arrays, slot);
        debug!(buffer_id, arrays, old_bytes = hold.byte_size(), "resized buffer");
        if self.initializing {
            drop(hold);
        } else {
            self.gen_holder.insert(HeldResource::Fallback(hold));
            self.sync_held_bytes();
        }
    }

    fn sync_held_bytes(&self) {
        self.table.set_generation_held_bytes(self.gen_holder.held_bytes());
    }

    /// Retire a buffer; it is freed once its generation is reclaimed
    ///
    /// Holding the primary buffer of a type first switches that type to a
    /// new primary buffer.
    pub fn hold_buffer(&mut self, buffer_id: u32) {
        let type_id = self.states[buffer_id as usize].type_id();
        if self.types[type_id as usize].primary_buffer_id == Some(buffer_id) {
            self.switch_primary_buffer(type_id, 0);
        }
        let slot = self.table.slot(buffer_id);
        let type_state = &mut self.types[type_id as usize];
        self.states[buffer_id as usize].on_hold(buffer_id, slot, &mut type_state.free_list);
        type_state.active_buffers.retain(|&id| id != buffer_id);
        self.hold_buffer_count += 1;
        self.gen_holder.insert(HeldResource::Buffer(buffer_id));
        debug!(buffer_id, type_id, "holding buffer");
    }

    fn done_hold_buffer(&mut self, buffer_id: u32) {
        assert!(self.hold_buffer_count > 0);
        self.hold_buffer_count -= 1;
        let slot = self.table.slot(buffer_id);
        self.states[buffer_id as usize].on_free(buffer_id, slot);
        debug!(buffer_id, "freed buffer");
    }

    fn release_held(&mut self, released: Vec<HeldResource>) {
        for resource in released {
            match resource {
                HeldResource::Buffer(buffer_id) => self.done_hold_buffer(buffer_id),
                HeldResource::Fallback(hold) => drop(hold),
            }
        }
        self.sync_held_bytes();
    }

    /// Retire `num_elems` elements at `entry_ref`
    ///
    /// The elements become reusable once their generation is reclaimed. In
    /// buffers without an elem hold list they are marked dead right away.
    pub fn hold_elem(&mut self, entry_ref: EntryRef, num_elems: usize) {
        let buffer_id = self.layout().buffer_id(entry_ref);
        let slot = self.table.slot(buffer_id);
        if !self.states[buffer_id as usize].hold_elems(num_elems, slot) {
            self.entry_ref_hold_list.insert(EntryRefHoldElem {
                entry_ref,
                num_elems,
            });
        }
    }

    /// Free elements no reader can observe, skipping the hold list
    pub fn free_elem(&mut self, entry_ref: EntryRef, num_elems: usize) {
        let buffer_id = self.layout().buffer_id(entry_ref);
        let slot = self.table.slot(buffer_id);
        if !self.states[buffer_id as usize].hold_elems(num_elems, slot) {
            self.free_elem_internal(entry_ref, num_elems);
        }
    }

    fn free_elem_internal(&mut self, entry_ref: EntryRef, num_elems: usize) {
        let layout = self.layout();
        let buffer_id = layout.buffer_id(entry_ref);
        let slot = self.table.slot(buffer_id);
        let state = &mut self.states[buffer_id as usize];
        let owner = &mut self.types[state.type_id() as usize].free_list;
        state.free_elems(entry_ref, num_elems, layout.offset(entry_ref), slot, owner);
    }

    pub fn assign_generation(&mut self, generation: Generation) {
        self.gen_holder.assign_generation(generation);
        self.entry_ref_hold_list.assign_generation(generation);
    }

    /// Free everything held at or before `oldest_used`; entries before buffers
    pub fn reclaim_memory(&mut self, oldest_used: Generation) {
        self.reclaim_entry_refs(oldest_used);
        let mut released = Vec::new();
        self.gen_holder.reclaim(oldest_used, |r| released.push(r));
        self.release_held(released);
    }

    pub fn reclaim_entry_refs(&mut self, oldest_used: Generation) {
        let mut released = Vec::new();
        self.entry_ref_hold_list.reclaim(oldest_used, |e| released.push(e));
        for elem in released {
            self.free_elem_internal(elem.entry_ref, elem.num_elems);
        }
    }

    /// Free everything held regardless of generation
    pub fn reclaim_all_memory(&mut self) {
        let mut elems = Vec::new();
        self.entry_ref_hold_list.reclaim_all(|e| elems.push(e));
        for elem in elems {
            self.free_elem_internal(elem.entry_ref, elem.num_elems);
        }
        let mut released = Vec::new();
        self.gen_holder.reclaim_all(|r| released.push(r));
        self.release_held(released);
    }

    /// Advance `handler`, tag pending holds and reclaim what readers no longer see
    pub fn commit(&mut self, handler: &GenerationHandler) -> Generation {
        let generation = handler.inc_generation();
        self.assign_generation(generation);
        self.reclaim_memory(handler.oldest_used_generation());
        generation
    }

    /// Pop a reclaimed entry of `type_id` for reuse
    pub fn pop_free_entry(&mut self, type_id: u32) -> Option<EntryRef> {
        let type_state = &mut self.types[type_id as usize];
        let buffer_id = type_state.free_list.current()?;
        let slot = self.table.slot(buffer_id);
        let entry_ref = self.states[buffer_id as usize]
            .free_list
            .pop_entry(&mut type_state.free_list, slot.stats.dead_elems_ref());
        Some(entry_ref)
    }

    pub fn enable_free_lists(&mut self) {
        for state in &mut self.states {
            if state.is_active() && !state.compacting() && !state.free_list.enabled() {
                state.enable_free_list();
            }
        }
        self.free_lists_enabled = true;
    }

    pub fn disable_free_lists(&mut self) {
        for state in &mut self.states {
            if let Some(type_state) = self.types.get_mut(state.type_id() as usize) {
                state.disable_free_list(&mut type_state.free_list);
            }
        }
        self.free_lists_enabled = false;
    }

    /// Mark retired elements dead immediately instead of holding them
    pub fn disable_elem_hold_list(&mut self) {
        for state in &mut self.states {
            if !state.is_free() {
                state.disable_elem_hold_list();
            }
        }
        self.disable_elem_hold_list = true;
    }

    /// While initializing, memory replaced by a resize is freed at once
    pub fn set_initializing(&mut self, initializing: bool) {
        self.initializing = initializing;
    }

    pub fn mem_stats(&self) -> MemoryStats {
        self.table.mem_stats()
    }

    pub fn address_space_usage(&self) -> AddressSpace {
        self.table.address_space_usage()
    }

    pub fn dynamic_memory_usage(&self) -> MemoryUsage {
        MemoryUsage::from(&self.mem_stats())
    }

    /// Buffer memory plus bookkeeping owned by the store
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = self.dynamic_memory_usage();
        let slot_bytes = self.max_num_buffers() as usize * mem::size_of::<super::buffer_table::BufferSlot>();
        let extra_allocated = slot_bytes
            + self.states.capacity() * mem::size_of::<BufferState>()
            + self.types.capacity() * mem::size_of::<TypeState>();
        let extra_used = slot_bytes
            + self.states.len() * mem::size_of::<BufferState>()
            + self.types.len() * mem::size_of::<TypeState>();
        usage.merge(&MemoryUsage {
            allocated_bytes: extra_allocated,
            used_bytes: extra_used,
            ..Default::default()
        });
        usage
    }

    /// Select the buffers to compact and mark them compacting
    pub fn start_compact_worst_buffers(
        &mut self,
        spec: CompactionSpec,
        strategy: &CompactionStrategy,
    ) -> CompactingBuffers {
        let bufferid_limit = self.bufferid_limit();
        let mut memory = CompactBufferCandidates::new(
            bufferid_limit,
            strategy.max_buffers,
            strategy.active_buffers_ratio,
            strategy.max_dead_bytes_ratio / 2.0,
            strategy.dead_bytes_slack,
        );
        let mut address_space = CompactBufferCandidates::new(
            bufferid_limit,
            strategy.max_buffers,
            strategy.active_buffers_ratio,
            strategy.max_dead_address_space_ratio / 2.0,
            strategy.dead_address_space_slack,
        );
        let mut free_buffers = self.max_num_buffers() - bufferid_limit;
        for (buffer_id, state) in self.states.iter().enumerate() {
            let buffer_id = buffer_id as u32;
            if state.is_free() {
                free_buffers += 1;
                continue;
            }
            if !state.is_active() || state.compacting() {
                continue;
            }
            let Some(handler) = state.handler() else {
                continue;
            };
            let stats = &self.table.slot(buffer_id).stats;
            let array_size = state.array_size();
            let elem_size = handler.elem_size();
            let used = stats.size();
            let dead = stats.dead_elems().saturating_sub(handler.reserved_elements(buffer_id));
            if spec.compact_memory() {
                memory.add(buffer_id, used * elem_size, dead * elem_size);
            }
            if spec.compact_address_space() {
                address_space.add(buffer_id, used / array_size, dead / array_size);
            }
        }
        memory.set_free_buffers(free_buffers);
        address_space.set_free_buffers(free_buffers);

        let mut selected = Vec::new();
        memory.select(&mut selected);
        address_space.select(&mut selected);
        selected.sort_unstable();
        selected.dedup();

        for &buffer_id in &selected {
            self.mark_compacting(buffer_id);
        }
        let mut targets: Vec<(u32, u32)> = selected
            .iter()
            .map(|&id| {
                let type_id = self.states[id as usize].type_id();
                (type_id, self.primary_buffer_id(type_id))
            })
            .collect();
        targets.sort_unstable();
        targets.dedup();

        if !selected.is_empty() {
            info!(
                buffers = ?selected,
                compact_memory = spec.compact_memory(),
                compact_address_space = spec.compact_address_space(),
                "starting compaction"
            );
        }
        CompactingBuffers::new(selected, bufferid_limit, self.layout(), targets)
    }

    fn mark_compacting(&mut self, buffer_id: u32) {
        let type_id = self.states[buffer_id as usize].type_id();
        let primary = self.primary_buffer_id(type_id);
        if primary == buffer_id || self.primary_buffer_too_dead(primary) {
            self.switch_primary_buffer(type_id, 0);
        }
        let state = &mut self.states[buffer_id as usize];
        assert!(!state.compacting(), "buffer {} already compacting", buffer_id);
        state.set_compacting();
        state.disable_elem_hold_list();
        state.disable_free_list(&mut self.types[type_id as usize].free_list);
        self.table.inc_compaction_count();
    }

    fn primary_buffer_too_dead(&self, buffer_id: u32) -> bool {
        let state = &self.states[buffer_id as usize];
        let stats = &self.table.slot(buffer_id).stats;
        let elem_size = state.handler().map_or(0, |h| h.elem_size());
        let dead = stats.dead_elems();
        dead * elem_size >= TOO_DEAD_SLACK && dead * 2 >= stats.size()
    }

    /// Hold every buffer of a finished compaction pass
    pub fn finish_compact(&mut self, mut compacting: CompactingBuffers) {
        let buffer_ids = compacting.finish();
        for &buffer_id in &buffer_ids {
            assert!(
                self.states[buffer_id as usize].compacting(),
                "buffer {} is not compacting",
                buffer_id
            );
            self.hold_buffer(buffer_id);
        }
        if !buffer_ids.is_empty() {
            info!(buffers = ?buffer_ids, "finished compaction");
        }
    }

    /// Pointer to `len` elements of `T` at `entry_ref`, checked against the
    /// buffer's element type and used range
    fn checked_elem_ptr<T: 'static>(&self, entry_ref: EntryRef, len: usize) -> *mut T {
        let layout = self.layout();
        let buffer_id = layout.buffer_id(entry_ref);
        assert!(
            (buffer_id as usize) < self.states.len(),
            "{} refers to buffer {} beyond limit {}",
            entry_ref,
            buffer_id,
            self.states.len()
        );
        let state = &self.states[buffer_id as usize];
        let Some(handler) = state.handler() else {
            panic!("{} refers to free buffer {}", entry_ref, buffer_id);
        };
        assert!(
            handler.elem_type() == TypeId::of::<T>(),
            "{} refers to buffer {} of another element type",
            entry_ref,
            buffer_id
        );
        let slot = self.table.slot(buffer_id);
        let start = layout.offset(entry_ref) * state.array_size();
        assert!(
            start + len <= slot.stats.size(),
            "{} out of range: {}+{} > {}",
            entry_ref,
            start,
            len,
            slot.stats.size()
        );
        // SAFETY: start + len is within the used range of the buffer
        unsafe { slot.get_buffer_relaxed().cast::<T>().add(start) }
    }

    pub fn get_entry<T: 'static>(&self, entry_ref: EntryRef) -> &T {
        // SAFETY: checked_elem_ptr validated type and range; elements in the
        // used range are initialized and owned by self
        unsafe { &*self.checked_elem_ptr::<T>(entry_ref, 1) }
    }

    pub fn get_entry_array<T: 'static>(&self, entry_ref: EntryRef, array_size: usize) -> &[T] {
        let ptr = self.checked_elem_ptr::<T>(entry_ref, array_size);
        // SAFETY: as in get_entry
        unsafe { std::slice::from_raw_parts(ptr, array_size) }
    }

    /// Mutable access for entries no reader can observe yet
    pub fn get_entry_mut<T: 'static>(&mut self, entry_ref: EntryRef) -> &mut T {
        // SAFETY: as in get_entry, and &mut self excludes other writer access
        unsafe { &mut *self.checked_elem_ptr::<T>(entry_ref, 1) }
    }

    pub fn get_entry_array_mut<T: 'static>(&mut self, entry_ref: EntryRef, array_size: usize) -> &mut [T] {
        let ptr = self.checked_elem_ptr::<T>(entry_ref, array_size);
        // SAFETY: as in get_entry_mut
        unsafe { std::slice::from_raw_parts_mut(ptr, array_size) }
    }

    /// Append whole arrays to the primary buffer of `type_id`
    pub fn push_values<T, I>(&mut self, type_id: u32, values: I) -> EntryRef
    where
        T: 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let values = values.into_iter();
        let num_elems = values.len();
        let handler = &self.types[type_id as usize].handler;
        let array_size = handler.array_size();
        assert!(
            handler.elem_type() == TypeId::of::<T>(),
            "type {} does not store this element type",
            type_id
        );
        assert!(
            num_elems > 0 && num_elems % array_size == 0,
            "{} elements is not a whole number of {}-element arrays",
            num_elems,
            array_size
        );

        self.ensure_buffer_capacity(type_id, num_elems);
        let layout = self.layout();
        let buffer_id = self.primary_buffer_id(type_id);
        let slot = self.table.slot(buffer_id);
        let used = slot.stats.size();
        let offset = used / array_size;
        assert!(offset < layout.offset_size(), "buffer {} offset overflow", buffer_id);

        let base = slot.get_buffer_relaxed().cast::<T>();
        let mut written = 0;
        for value in values.take(num_elems) {
            // SAFETY: capacity was ensured above; slots past `used` are uninitialized
            unsafe { base.add(used + written).write(value) };
            written += 1;
        }
        assert_eq!(written, num_elems, "iterator yielded fewer elements than its length");
        slot.stats.pushed_back(num_elems);
        layout.make(buffer_id, offset)
    }

    fn drop_buffers(&mut self) {
        self.disable_free_lists();
        for (buffer_id, state) in self.states.iter_mut().enumerate() {
            state.drop_buffer(self.table.slot(buffer_id as u32), None);
        }
        self.hold_buffer_count = 0;
        self.sync_held_bytes();
    }
}

impl Drop for DataStoreBase {
    fn drop(&mut self) {
        self.reclaim_all_memory();
        self.drop_buffers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::buffer_type::BufferType;

    fn store_with<T>(array_size: usize, min_arrays: usize) -> (DataStoreBase, u32)
    where
        T: Clone + Default + Send + Sync + 'static,
    {
        let mut base = DataStoreBase::new(RefLayout::new(12).unwrap(), 64, 4096).unwrap();
        let type_id = base.add_type(Arc::new(BufferType::<T>::new(array_size, min_arrays, 4096)));
        base.init_primary_buffers();
        (base, type_id)
    }

    #[test]
    fn test_new_validates_arguments() {
        let layout = RefLayout::new(30).unwrap();
        assert!(DataStoreBase::new(layout, 5, 16).is_err());
        assert!(DataStoreBase::new(layout, 0, 16).is_err());
        assert!(DataStoreBase::new(layout, 4, 1 << 31).is_err());
        assert!(DataStoreBase::new(layout, 4, 16).is_ok());
    }

    #[test]
    fn test_init_primary_buffers() {
        let mut base = DataStoreBase::new(RefLayout::new(12).unwrap(), 64, 4096).unwrap();
        let first = base.add_type(Arc::new(BufferType::<u32>::new(1, 4, 4096)));
        let second = base.add_type(Arc::new(BufferType::<u64>::new(2, 4, 4096)));
        base.init_primary_buffers();

        assert_eq!(base.primary_buffer_id(first), 0);
        assert_eq!(base.primary_buffer_id(second), 1);
        assert_eq!(base.bufferid_limit(), 2);
        assert_eq!(base.type_id_of::<u64>(), Some(second));
        assert_eq!(base.type_id_of::<String>(), None);

        // Buffer 0 reserves one array that never becomes live
        let stats = base.buffer_stats(0);
        assert_eq!(stats.used_elems, 1);
        assert_eq!(stats.dead_elems, 1);
        assert_eq!(base.buffer_stats(1).used_elems, 0);
    }

    #[test]
    fn test_push_and_get() {
        let (mut base, type_id) = store_with::<u64>(1, 4);
        let a = base.push_values(type_id, [10u64]);
        let b = base.push_values(type_id, [20u64]);
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert_eq!(*base.get_entry::<u64>(a), 10);
        *base.get_entry_mut::<u64>(b) += 1;
        assert_eq!(*base.get_entry::<u64>(b), 21);
    }

    #[test]
    fn test_push_arrays() {
        let (mut base, type_id) = store_with::<u32>(3, 4);
        let r = base.push_values(type_id, vec![1u32, 2, 3]);
        assert_eq!(base.layout().offset(r), 1);
        assert_eq!(base.get_entry_array::<u32>(r, 3), &[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "another element type")]
    fn test_get_wrong_type_panics() {
        let (mut base, type_id) = store_with::<u64>(1, 4);
        let r = base.push_values(type_id, [1u64]);
        base.get_entry::<u32>(r);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_get_unused_offset_panics() {
        let (base, _) = store_with::<u64>(1, 4);
        base.get_entry::<u64>(base.layout().make(0, 3));
    }

    #[test]
    fn test_hold_buffer_switches_primary() {
        let (mut base, type_id) = store_with::<u64>(1, 4);
        base.push_values(type_id, [1u64]);
        base.hold_buffer(0);

        assert_eq!(base.primary_buffer_id(type_id), 1);
        assert_eq!(base.buffer_status(0), BufferStatus::Hold);
        assert!(base.has_held_buffers());

        base.assign_generation(1);
        base.reclaim_memory(0);
        assert_eq!(base.buffer_status(0), BufferStatus::Hold);
        base.reclaim_memory(1);
        assert_eq!(base.buffer_status(0), BufferStatus::Free);
        assert!(!base.has_held_buffers());

        // Free buffer ids are reused before the limit grows
        base.switch_primary_buffer(type_id, 0);
        assert_eq!(base.primary_buffer_id(type_id), 0);
        assert_eq!(base.bufferid_limit(), 2);
    }

    #[test]
    fn test_fallback_resize_holds_old_memory() {
        let mut base = DataStoreBase::new(RefLayout::new(12).unwrap(), 64, 4096).unwrap();
        let policy = GrowthPolicy::new(2, 4096).with_num_arrays_for_new_buffer(1024);
        let type_id = base.add_type(Arc::new(BufferType::<u64>::with_policy(1, policy)));
        base.init_primary_buffers();

        let refs: Vec<EntryRef> = (0..10u64).map(|v| base.push_values(type_id, [v])).collect();
        // Grown in place rather than switched
        assert_eq!(base.bufferid_limit(), 1);
        assert!(base.mem_stats().hold_bytes > 0);
        for (v, r) in refs.iter().enumerate() {
            assert_eq!(*base.get_entry::<u64>(*r), v as u64);
        }

        base.assign_generation(1);
        base.reclaim_memory(1);
        assert_eq!(base.mem_stats().hold_bytes, 0);
    }

    #[test]
    fn test_initializing_frees_resized_memory_at_once() {
        let mut base = DataStoreBase::new(RefLayout::new(12).unwrap(), 64, 4096).unwrap();
        let policy = GrowthPolicy::new(2, 4096).with_num_arrays_for_new_buffer(1024);
        let type_id = base.add_type(Arc::new(BufferType::<u64>::with_policy(1, policy)));
        base.init_primary_buffers();
        base.set_initializing(true);
        for v in 0..10u64 {
            base.push_values(type_id, [v]);
        }
        assert_eq!(base.mem_stats().hold_bytes, 0);
    }

    #[test]
    fn test_hold_elem_and_reclaim() {
        let (mut base, type_id) = store_with::<String>(1, 4);
        base.enable_free_lists();
        let r = base.push_values(type_id, ["held".to_string()]);

        base.hold_elem(r, 1);
        assert_eq!(base.buffer_stats(0).hold_elems, 1);
        base.assign_generation(5);
        base.reclaim_memory(4);
        assert_eq!(base.buffer_stats(0).hold_elems, 1);
        assert!(base.pop_free_entry(type_id).is_none());

        base.reclaim_memory(5);
        let stats = base.buffer_stats(0);
        assert_eq!(stats.hold_elems, 0);
        assert_eq!(stats.dead_elems, 2);
        assert_eq!(base.get_entry::<String>(r), "");

        assert_eq!(base.pop_free_entry(type_id), Some(r));
        assert_eq!(base.buffer_stats(0).dead_elems, 1);
    }

    #[test]
    fn test_free_elem_is_immediate() {
        let (mut base, type_id) = store_with::<u32>(1, 4);
        base.enable_free_lists();
        let r = base.push_values(type_id, [9u32]);
        base.free_elem(r, 1);
        assert_eq!(base.pop_free_entry(type_id), Some(r));
    }

    #[test]
    fn test_disabled_elem_hold_list_marks_dead() {
        let (mut base, type_id) = store_with::<u32>(1, 4);
        let r = base.push_values(type_id, [9u32]);
        base.disable_elem_hold_list();
        base.hold_elem(r, 1);
        let stats = base.buffer_stats(0);
        assert_eq!(stats.hold_elems, 0);
        assert_eq!(stats.dead_elems, 2);
    }

    #[test]
    fn test_commit_reclaims_when_no_guards() {
        let (mut base, type_id) = store_with::<u32>(1, 4);
        base.enable_free_lists();
        let handler = GenerationHandler::new();
        let r = base.push_values(type_id, [1u32]);

        let guard = handler.take_guard();
        base.hold_elem(r, 1);
        base.commit(&handler);
        assert_eq!(base.buffer_stats(0).hold_elems, 1);

        drop(guard);
        base.commit(&handler);
        assert_eq!(base.buffer_stats(0).hold_elems, 0);
        assert_eq!(base.pop_free_entry(type_id), Some(r));
    }

    #[test]
    fn test_memory_usage_includes_bookkeeping() {
        let (base, _) = store_with::<u64>(1, 4);
        let dynamic = base.dynamic_memory_usage();
        let total = base.memory_usage();
        assert_eq!(dynamic.allocated_bytes, 4 * 8);
        assert!(total.allocated_bytes > dynamic.allocated_bytes);
        assert!(total.used_bytes > dynamic.used_bytes);
    }

    #[test]
    fn test_drop_destroys_elements() {
        let tracker = Arc::new(());
        {
            let (mut base, type_id) = store_with::<Option<Arc<()>>>(1, 4);
            for _ in 0..20 {
                base.push_values(type_id, [Some(Arc::clone(&tracker))]);
            }
            let r = base.push_values(type_id, [Some(Arc::clone(&tracker))]);
            base.hold_elem(r, 1);
            assert!(Arc::strong_count(&tracker) > 1);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
