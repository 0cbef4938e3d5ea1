//! Memory accounting for data stores

use serde::{Deserialize, Serialize};

/// Aggregated memory statistics over all buffers of a store
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub alloc_elems: usize,
    pub used_elems: usize,
    pub dead_elems: usize,
    pub hold_elems: usize,
    pub alloc_bytes: usize,
    pub used_bytes: usize,
    pub dead_bytes: usize,
    pub hold_bytes: usize,
    pub free_buffers: usize,
    pub active_buffers: usize,
    pub hold_buffers: usize,
}

impl MemoryStats {
    /// Fraction of used bytes that is dead
    pub fn dead_ratio(&self) -> f64 {
        if self.used_bytes == 0 {
            0.0
        } else {
            self.dead_bytes as f64 / self.used_bytes as f64
        }
    }
}

/// Element counters of one buffer at a point in time
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatsSnapshot {
    pub alloc_elems: usize,
    pub used_elems: usize,
    pub dead_elems: usize,
    pub hold_elems: usize,
}

impl BufferStatsSnapshot {
    pub fn remaining(&self) -> usize {
        self.alloc_elems - self.used_elems
    }
}

/// Address space usage in arrays
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    used: usize,
    dead: usize,
    limit: usize,
}

impl AddressSpace {
    pub fn new(used: usize, dead: usize, limit: usize) -> Self {
        Self { used, dead, limit }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn dead(&self) -> usize {
        self.dead
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Used address space not counting dead arrays
    pub fn live(&self) -> usize {
        self.used - self.dead
    }

    pub fn usage(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.live() as f64 / self.limit as f64
        }
    }
}

/// Memory usage in bytes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub allocated_bytes: usize,
    pub used_bytes: usize,
    pub dead_bytes: usize,
    pub allocated_bytes_on_hold: usize,
}

impl MemoryUsage {
    pub fn merge(&mut self, other: &MemoryUsage) {
        self.allocated_bytes += other.allocated_bytes;
        self.used_bytes += other.used_bytes;
        self.dead_bytes += other.dead_bytes;
        self.allocated_bytes_on_hold += other.allocated_bytes_on_hold;
    }
}

impl From<&MemoryStats> for MemoryUsage {
    fn from(stats: &MemoryStats) -> Self {
        Self {
            allocated_bytes: stats.alloc_bytes,
            used_bytes: stats.used_bytes,
            dead_bytes: stats.dead_bytes,
            allocated_bytes_on_hold: stats.hold_bytes,
        }
    }
}
