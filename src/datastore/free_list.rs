//! Free lists for reusing reclaimed entries
//!
//! Each buffer keeps a LIFO stack of reclaimed refs. A buffer is attached to
//! the free list of its type only while that stack is non-empty, so the
//! allocator can pick a buffer with reusable entries without scanning.

use super::entry_ref::EntryRef;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Buffers of one type that currently have reclaimed entries
#[derive(Debug, Default)]
pub struct FreeList {
    attached: Vec<u32>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, buffer_id: u32) {
        assert!(
            !self.attached.contains(&buffer_id),
            "buffer {} already attached to free list",
            buffer_id
        );
        self.attached.push(buffer_id);
    }

    pub fn detach(&mut self, buffer_id: u32) {
        assert!(!self.attached.is_empty(), "detach from empty free list");
        if self.attached.last() == Some(&buffer_id) {
            self.attached.pop();
            return;
        }
        let pos = self
            .attached
            .iter()
            .position(|&id| id == buffer_id)
            .unwrap_or_else(|| panic!("buffer {} not attached to free list", buffer_id));
        self.attached.remove(pos);
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    /// Number of attached buffers
    pub fn len(&self) -> usize {
        self.attached.len()
    }

    /// Buffer to pop the next free entry from
    pub fn current(&self) -> Option<u32> {
        self.attached.last().copied()
    }
}

/// Reclaimed entries of a single buffer
#[derive(Debug, Default)]
pub struct BufferFreeList {
    buffer_id: u32,
    array_size: usize,
    enabled: bool,
    free_refs: Vec<EntryRef>,
}

impl BufferFreeList {
    pub fn new(buffer_id: u32) -> Self {
        Self {
            buffer_id,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_empty(&self) -> bool {
        self.free_refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.free_refs.len()
    }

    pub fn enable(&mut self, array_size: usize) {
        assert!(!self.enabled, "free list for buffer {} already enabled", self.buffer_id);
        assert!(
            self.free_refs.is_empty(),
            "free list for buffer {} still holds entries",
            self.buffer_id
        );
        self.array_size = array_size;
        self.enabled = true;
    }

    /// Stop tracking reclaimed entries; those already collected are abandoned
    pub fn disable(&mut self, owner: &mut FreeList) {
        if !self.is_empty() {
            owner.detach(self.buffer_id);
            self.free_refs = Vec::new();
        }
        self.enabled = false;
    }

    pub fn push_entry(&mut self, entry_ref: EntryRef, owner: &mut FreeList) {
        assert!(self.enabled, "push to disabled free list for buffer {}", self.buffer_id);
        if self.is_empty() {
            owner.attach(self.buffer_id);
        }
        self.free_refs.push(entry_ref);
    }

    /// Pop the most recently freed entry, un-counting it as dead
    pub fn pop_entry(&mut self, owner: &mut FreeList, dead_elems: &AtomicUsize) -> EntryRef {
        let entry_ref = self
            .free_refs
            .pop()
            .unwrap_or_else(|| panic!("pop from empty free list for buffer {}", self.buffer_id));
        if self.is_empty() {
            owner.detach(self.buffer_id);
        }
        let dead = dead_elems.load(Ordering::Relaxed);
        dead_elems.store(dead - self.array_size, Ordering::Relaxed);
        entry_ref
    }
}
