//! Writer-side lifecycle of a single buffer
//!
//! ```text
//! Free ──on_active──▶ Active ──on_hold──▶ Hold ──on_free──▶ Free
//!                       │  ▲
//!                       └──┘ fallback_resize
//! ```

use super::buffer_table::{BufferSlot, RawAlloc};
use super::buffer_type::BufferTypeBase;
use super::entry_ref::EntryRef;
use super::free_list::{BufferFreeList, FreeList};
use crate::generation::HeldBytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Status of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BufferStatus {
    Free = 0,
    Active = 1,
    Hold = 2,
}

impl BufferStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => BufferStatus::Free,
            1 => BufferStatus::Active,
            2 => BufferStatus::Hold,
            other => unreachable!("invalid buffer status {}", other),
        }
    }
}

impl fmt::Display for BufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferStatus::Free => "free",
            BufferStatus::Active => "active",
            BufferStatus::Hold => "hold",
        };
        f.write_str(name)
    }
}

/// Old buffer memory kept alive after a resize until readers have moved on
pub(crate) struct FallbackHold {
    alloc: RawAlloc,
    used_elems: usize,
    handler: Arc<dyn BufferTypeBase>,
}

impl HeldBytes for FallbackHold {
    fn byte_size(&self) -> usize {
        self.alloc.byte_size()
    }
}

impl Drop for FallbackHold {
    fn drop(&mut self) {
        // SAFETY: the first used_elems elements were initialized and no
        // reader can observe this allocation any more
        unsafe { self.handler.destroy_elements(self.alloc.as_ptr(), self.used_elems) };
    }
}

/// Writer-owned state of one buffer
///
/// Counters shared with readers live in the matching [`BufferSlot`], which is
/// passed in by the store.
pub struct BufferState {
    /// Writer's copy of the status published in the slot
    status: BufferStatus,
    /// Backing memory; `None` while free
    alloc: Option<RawAlloc>,
    /// Element hooks of the owning type; `None` while free
    handler: Option<Arc<dyn BufferTypeBase>>,
    /// Owning type
    type_id: u32,
    /// Elements per entry
    array_size: usize,
    /// Selected by a compaction pass that has not finished
    compacting: bool,
    /// Retired elements are marked dead at once instead of held
    disable_elem_hold_list: bool,
    /// Reclaimed refs ready for reuse
    pub(crate) free_list: BufferFreeList,
}

impl fmt::Debug for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferState")
            .field("status", &self.status)
            .field("type_id", &self.type_id)
            .field("array_size", &self.array_size)
            .field("compacting", &self.compacting)
            .field("free_list", &self.free_list)
            .finish()
    }
}

impl BufferState {
    pub(crate) fn new(buffer_id: u32) -> Self {
        Self {
            status: BufferStatus::Free,
            alloc: None,
            handler: None,
            type_id: 0,
            array_size: 0,
            compacting: false,
            disable_elem_hold_list: false,
            free_list: BufferFreeList::new(buffer_id),
        }
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    pub fn is_free(&self) -> bool {
        self.status == BufferStatus::Free
    }

    pub fn is_active(&self) -> bool {
        self.status == BufferStatus::Active
    }

    pub fn is_on_hold(&self) -> bool {
        self.status == BufferStatus::Hold
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn array_size(&self) -> usize {
        self.array_size
    }

    pub fn compacting(&self) -> bool {
        self.compacting
    }

    pub fn has_disabled_elem_hold_list(&self) -> bool {
        self.disable_elem_hold_list
    }

    pub(crate) fn handler(&self) -> Option<&Arc<dyn BufferTypeBase>> {
        self.handler.as_ref()
    }

    pub(crate) fn set_compacting(&mut self) {
        self.compacting = true;
    }

    pub(crate) fn disable_elem_hold_list(&mut self) {
        self.disable_elem_hold_list = true;
    }

    pub(crate) fn enable_free_list(&mut self) {
        self.free_list.enable(self.array_size);
    }

    pub(crate) fn disable_free_list(&mut self, owner: &mut FreeList) {
        self.free_list.disable(owner);
    }

    /// Allocate memory for `arrays` arrays and start serving allocations
    pub(crate) fn on_active(
        &mut self,
        buffer_id: u32,
        type_id: u32,
        handler: Arc<dyn BufferTypeBase>,
        arrays: usize,
        disable_elem_hold_list: bool,
        slot: &BufferSlot,
    ) {
        assert!(self.is_free(), "buffer {} activated while {}", buffer_id, self.status);
        assert!(self.alloc.is_none());
        let array_size = handler.array_size();
        let reserved = handler.reserved_elements(buffer_id);
        let alloc_elems = arrays * array_size;
        assert!(
            reserved <= alloc_elems,
            "buffer {} too small for {} reserved elements",
            buffer_id,
            reserved
        );

        let alloc = RawAlloc::new(handler.elem_size(), handler.elem_align(), alloc_elems);
        // SAFETY: the allocation has room for alloc_elems >= reserved elements
        unsafe { handler.initialize_reserved_elements(alloc.as_ptr(), reserved) };

        slot.stats.set_alloc_elems(alloc_elems);
        slot.stats.set_used_elems(reserved);
        slot.stats.set_dead_elems(reserved);
        slot.stats.set_hold_elems(0);
        slot.set_meta(type_id, array_size, handler.elem_size());
        slot.publish_buffer(alloc.as_ptr().as_ptr());
        slot.set_status(BufferStatus::Active);

        self.alloc = Some(alloc);
        self.handler = Some(handler);
        self.type_id = type_id;
        self.array_size = array_size;
        self.compacting = false;
        self.disable_elem_hold_list = disable_elem_hold_list;
        self.status = BufferStatus::Active;
    }

    /// Retire the buffer; all used elements count as held from now on
    pub(crate) fn on_hold(&mut self, buffer_id: u32, slot: &BufferSlot, owner: &mut FreeList) {
        assert!(self.is_active(), "buffer {} held while {}", buffer_id, self.status);
        let size = slot.stats.size();
        let dead = slot.stats.dead_elems();
        assert!(dead <= size);
        assert!(slot.stats.hold_elems() <= size - dead);
        slot.stats.set_dead_elems(0);
        slot.stats.set_hold_elems(size);
        slot.set_status(BufferStatus::Hold);
        self.free_list.disable(owner);
        self.compacting = false;
        self.status = BufferStatus::Hold;
    }

    /// Destroy elements and release memory
    pub(crate) fn on_free(&mut self, buffer_id: u32, slot: &BufferSlot) {
        assert!(self.is_on_hold(), "buffer {} freed while {}", buffer_id, self.status);
        self.release(slot);
    }

    /// Release the buffer regardless of state; only valid without readers
    pub(crate) fn drop_buffer(&mut self, slot: &BufferSlot, owner: Option<&mut FreeList>) {
        if self.is_free() {
            return;
        }
        if let Some(owner) = owner {
            self.free_list.disable(owner);
        }
        self.release(slot);
    }

    fn release(&mut self, slot: &BufferSlot) {
        let used = slot.stats.size();
        slot.publish_buffer(std::ptr::null_mut());
        if let (Some(alloc), Some(handler)) = (self.alloc.take(), self.handler.take()) {
            // SAFETY: the first `used` elements are initialized and unobservable
            unsafe { handler.destroy_elements(alloc.as_ptr(), used) };
        }
        slot.stats.reset();
        slot.set_status(BufferStatus::Free);
        self.compacting = false;
        self.disable_elem_hold_list = false;
        self.status = BufferStatus::Free;
    }

    /// Move live elements into a larger allocation
    ///
    /// The old allocation is returned so that it can be held until readers
    /// no longer observe it.
    pub(crate) fn fallback_resize(
        &mut self,
        buffer_id: u32,
        arrays: usize,
        slot: &BufferSlot,
    ) -> FallbackHold {
        assert!(self.is_active(), "buffer {} resized while {}", buffer_id, self.status);
        let (Some(handler), Some(old_alloc)) = (self.handler.clone(), self.alloc.take()) else {
            panic!("active buffer {} without memory", buffer_id);
        };
        let used = slot.stats.size();
        let alloc_elems = arrays * self.array_size;
        assert!(alloc_elems >= used);

        let new_alloc = RawAlloc::new(handler.elem_size(), handler.elem_align(), alloc_elems);
        // SAFETY: used elements are initialized in old_alloc, new_alloc has room
        unsafe { handler.fallback_copy(new_alloc.as_ptr(), old_alloc.as_ptr(), used) };

        slot.publish_buffer(new_alloc.as_ptr().as_ptr());
        slot.stats.set_alloc_elems(alloc_elems);
        self.alloc = Some(new_alloc);

        FallbackHold {
            alloc: old_alloc,
            used_elems: used,
            handler,
        }
    }

    /// Account for elements being retired
    ///
    /// Returns true when the elements were marked dead directly and need no
    /// entry on the hold list.
    pub(crate) fn hold_elems(&mut self, num_elems: usize, slot: &BufferSlot) -> bool {
        assert!(self.is_active(), "hold of elements in {} buffer", self.status);
        if self.disable_elem_hold_list {
            slot.stats.inc_dead_elems(num_elems);
            return true;
        }
        slot.stats.inc_hold_elems(num_elems);
        false
    }

    /// Turn held elements into dead ones, making them reusable when possible
    pub(crate) fn free_elems(
        &mut self,
        entry_ref: EntryRef,
        num_elems: usize,
        ref_offset: usize,
        slot: &BufferSlot,
        owner: &mut FreeList,
    ) {
        assert!(
            self.is_active() || self.is_on_hold(),
            "free of elements in {} buffer",
            self.status
        );
        slot.stats.inc_dead_elems(num_elems);
        slot.stats.dec_hold_elems(num_elems);
        if let (Some(alloc), Some(handler)) = (self.alloc.as_ref(), self.handler.as_ref()) {
            // SAFETY: held elements are initialized and no reader observes them
            unsafe { handler.clean_hold(alloc.as_ptr(), ref_offset * self.array_size, num_elems) };
        }
        if self.is_active() && self.free_list.enabled() && num_elems == self.array_size {
            self.free_list.push_entry(entry_ref, owner);
        }
    }
}
