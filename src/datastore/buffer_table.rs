//! Reader-visible buffer table
//!
//! The table is created once with a fixed number of slots and shared between
//! the writer and all readers. Everything in it is atomic: the writer
//! publishes buffer memory with release stores and readers observe it with
//! acquire loads.

use super::buffer_state::BufferStatus;
use super::entry_ref::RefLayout;
use super::memory_stats::{AddressSpace, BufferStatsSnapshot, MemoryStats};
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Owned raw memory for one buffer
///
/// Only the bytes are owned; dropping the elements stored inside is the
/// responsibility of the type handler.
pub(crate) struct RawAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: RawAlloc uniquely owns its memory; the element types placed in it
// are required to be Send + Sync by the type handlers.
unsafe impl Send for RawAlloc {}
unsafe impl Sync for RawAlloc {}

impl RawAlloc {
    /// Allocate room for `num_elems` elements; allocation failure aborts
    pub(crate) fn new(elem_size: usize, elem_align: usize, num_elems: usize) -> Self {
        let size = elem_size
            .checked_mul(num_elems)
            .unwrap_or_else(|| panic!("buffer size overflow: {} x {} bytes", num_elems, elem_size));
        let layout = Layout::from_size_align(size.max(elem_align), elem_align)
            .unwrap_or_else(|e| panic!("invalid buffer layout ({} bytes): {}", size, e));
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for RawAlloc {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Element counters for one buffer
///
/// Written only by the writer (relaxed load + store), read by anyone.
#[derive(Debug, Default)]
pub(crate) struct BufferStats {
    alloc_elems: AtomicUsize,
    used_elems: AtomicUsize,
    dead_elems: AtomicUsize,
    hold_elems: AtomicUsize,
}

impl BufferStats {
    pub(crate) fn capacity(&self) -> usize {
        self.alloc_elems.load(Ordering::Relaxed)
    }

    pub(crate) fn size(&self) -> usize {
        self.used_elems.load(Ordering::Relaxed)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity() - self.size()
    }

    pub(crate) fn dead_elems(&self) -> usize {
        self.dead_elems.load(Ordering::Relaxed)
    }

    pub(crate) fn hold_elems(&self) -> usize {
        self.hold_elems.load(Ordering::Relaxed)
    }

    pub(crate) fn dead_elems_ref(&self) -> &AtomicUsize {
        &self.dead_elems
    }

    pub(crate) fn set_alloc_elems(&self, value: usize) {
        self.alloc_elems.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_used_elems(&self, value: usize) {
        self.used_elems.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_dead_elems(&self, value: usize) {
        self.dead_elems.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_hold_elems(&self, value: usize) {
        self.hold_elems.store(value, Ordering::Relaxed);
    }

    pub(crate) fn pushed_back(&self, num_elems: usize) {
        self.set_used_elems(self.size() + num_elems);
    }

    pub(crate) fn inc_dead_elems(&self, num_elems: usize) {
        self.set_dead_elems(self.dead_elems() + num_elems);
    }

    pub(crate) fn inc_hold_elems(&self, num_elems: usize) {
        self.set_hold_elems(self.hold_elems() + num_elems);
    }

    pub(crate) fn dec_hold_elems(&self, num_elems: usize) {
        let hold = self.hold_elems();
        assert!(hold >= num_elems, "hold elems underflow: {} < {}", hold, num_elems);
        self.set_hold_elems(hold - num_elems);
    }

    pub(crate) fn reset(&self) {
        self.set_used_elems(0);
        self.set_alloc_elems(0);
        self.set_dead_elems(0);
        self.set_hold_elems(0);
    }

    pub(crate) fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            alloc_elems: self.capacity(),
            used_elems: self.size(),
            dead_elems: self.dead_elems(),
            hold_elems: self.hold_elems(),
        }
    }

    fn add_to_mem_stats(&self, elem_size: usize, stats: &mut MemoryStats) {
        let alloc = self.capacity();
        let used = self.size();
        let dead = self.dead_elems();
        let hold = self.hold_elems();
        stats.alloc_elems += alloc;
        stats.used_elems += used;
        stats.dead_elems += dead;
        stats.hold_elems += hold;
        stats.alloc_bytes += alloc * elem_size;
        stats.used_bytes += used * elem_size;
        stats.dead_bytes += dead * elem_size;
        stats.hold_bytes += hold * elem_size;
    }
}

/// One entry of the buffer table
#[derive(Debug)]
pub(crate) struct BufferSlot {
    buffer: AtomicPtr<u8>,
    status: AtomicU8,
    type_id: AtomicU32,
    array_size: AtomicUsize,
    elem_size: AtomicUsize,
    pub(crate) stats: BufferStats,
}

impl BufferSlot {
    fn new() -> Self {
        Self {
            buffer: AtomicPtr::new(ptr::null_mut()),
            status: AtomicU8::new(BufferStatus::Free as u8),
            type_id: AtomicU32::new(0),
            array_size: AtomicUsize::new(0),
            elem_size: AtomicUsize::new(0),
            stats: BufferStats::default(),
        }
    }

    /// Buffer pointer as seen by the writer
    #[inline]
    pub(crate) fn get_buffer_relaxed(&self) -> *mut u8 {
        self.buffer.load(Ordering::Relaxed)
    }

    /// Buffer pointer as seen by readers
    #[inline]
    pub(crate) fn get_buffer_acquire(&self) -> *mut u8 {
        self.buffer.load(Ordering::Acquire)
    }

    pub(crate) fn publish_buffer(&self, buffer: *mut u8) {
        self.buffer.store(buffer, Ordering::Release);
    }

    pub(crate) fn status(&self) -> BufferStatus {
        BufferStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: BufferStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn set_meta(&self, type_id: u32, array_size: usize, elem_size: usize) {
        self.type_id.store(type_id, Ordering::Relaxed);
        self.array_size.store(array_size, Ordering::Relaxed);
        self.elem_size.store(elem_size, Ordering::Relaxed);
    }

    pub(crate) fn type_id(&self) -> u32 {
        self.type_id.load(Ordering::Relaxed)
    }

    pub(crate) fn array_size(&self) -> usize {
        self.array_size.load(Ordering::Relaxed)
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size.load(Ordering::Relaxed)
    }
}

/// Fixed-size table of buffer slots shared by the writer and readers
#[derive(Debug)]
pub(crate) struct BufferTable {
    slots: Box<[BufferSlot]>,
    layout: RefLayout,
    max_arrays: usize,
    buffer_id_limit: AtomicU32,
    compaction_count: AtomicU64,
    generation_held_bytes: AtomicUsize,
}

impl BufferTable {
    pub(crate) fn new(num_buffers: u32, layout: RefLayout, max_arrays: usize) -> Self {
        let slots = (0..num_buffers).map(|_| BufferSlot::new()).collect();
        Self {
            slots,
            layout,
            max_arrays,
            buffer_id_limit: AtomicU32::new(0),
            compaction_count: AtomicU64::new(0),
            generation_held_bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, buffer_id: u32) -> &BufferSlot {
        &self.slots[buffer_id as usize]
    }

    pub(crate) fn layout(&self) -> RefLayout {
        self.layout
    }

    pub(crate) fn max_arrays(&self) -> usize {
        self.max_arrays
    }

    pub(crate) fn max_num_buffers(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub(crate) fn bufferid_limit_acquire(&self) -> u32 {
        self.buffer_id_limit.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn bufferid_limit_relaxed(&self) -> u32 {
        self.buffer_id_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bufferid_limit(&self, limit: u32) {
        self.buffer_id_limit.store(limit, Ordering::Release);
    }

    pub(crate) fn compaction_count(&self) -> u64 {
        self.compaction_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_compaction_count(&self) {
        self.compaction_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn generation_held_bytes(&self) -> usize {
        self.generation_held_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn set_generation_held_bytes(&self, bytes: usize) {
        self.generation_held_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Aggregate memory statistics over all buffers
    pub(crate) fn mem_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        let limit = self.bufferid_limit_acquire();
        stats.free_buffers = (self.max_num_buffers() - limit) as usize;
        for buffer_id in 0..limit {
            let slot = self.slot(buffer_id);
            match slot.status() {
                BufferStatus::Free => stats.free_buffers += 1,
                BufferStatus::Active => {
                    stats.active_buffers += 1;
                    slot.stats.add_to_mem_stats(slot.elem_size(), &mut stats);
                }
                BufferStatus::Hold => {
                    stats.hold_buffers += 1;
                    slot.stats.add_to_mem_stats(slot.elem_size(), &mut stats);
                }
            }
        }
        let held_bytes = self.generation_held_bytes();
        stats.hold_bytes += held_bytes;
        stats.alloc_bytes += held_bytes;
        stats.used_bytes += held_bytes;
        stats
    }

    /// Address space usage counted in arrays
    pub(crate) fn address_space_usage(&self) -> AddressSpace {
        let limit = self.bufferid_limit_acquire();
        let mut used = 0usize;
        let mut dead = 0usize;
        let mut limit_arrays = self.max_arrays * (self.max_num_buffers() - limit) as usize;
        for buffer_id in 0..limit {
            let slot = self.slot(buffer_id);
            match slot.status() {
                BufferStatus::Free => limit_arrays += self.max_arrays,
                BufferStatus::Active => {
                    let array_size = slot.array_size();
                    used += slot.stats.size() / array_size;
                    dead += slot.stats.dead_elems() / array_size;
                    limit_arrays += slot.stats.capacity() / array_size;
                }
                BufferStatus::Hold => {
                    let array_size = slot.array_size();
                    used += slot.stats.size() / array_size;
                    limit_arrays += slot.stats.capacity() / array_size;
                }
            }
        }
        AddressSpace::new(used, dead, limit_arrays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_alloc_alignment() {
        let alloc = RawAlloc::new(8, 8, 16);
        assert_eq!(alloc.byte_size(), 128);
        assert_eq!(alloc.as_ptr().as_ptr() as usize % 8, 0);

        // Empty buffers still get a valid, aligned pointer
        let empty = RawAlloc::new(16, 16, 0);
        assert_eq!(empty.as_ptr().as_ptr() as usize % 16, 0);
    }

    #[test]
    fn test_buffer_stats_counters() {
        let stats = BufferStats::default();
        stats.set_alloc_elems(10);
        stats.pushed_back(4);
        stats.inc_hold_elems(2);
        stats.dec_hold_elems(1);
        stats.inc_dead_elems(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.alloc_elems, 10);
        assert_eq!(snapshot.used_elems, 4);
        assert_eq!(snapshot.hold_elems, 1);
        assert_eq!(snapshot.dead_elems, 1);
        assert_eq!(stats.remaining(), 6);

        stats.reset();
        assert_eq!(stats.snapshot(), BufferStatsSnapshot::default());
    }

    #[test]
    fn test_empty_table_stats() {
        let table = BufferTable::new(4, RefLayout::new(8).unwrap(), 256);
        let stats = table.mem_stats();
        assert_eq!(stats.free_buffers, 4);
        assert_eq!(stats.active_buffers, 0);

        let space = table.address_space_usage();
        assert_eq!(space.used(), 0);
        assert_eq!(space.limit(), 4 * 256);
    }
}
