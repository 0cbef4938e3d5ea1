//! Data Store
//!
//! Generation-aware arena storing fixed-size records in typed buffers and
//! handing out 32-bit refs instead of pointers. One writer, many readers.
//!
//! # Architecture
//!
//! ```text
//! DataStoreBase (writer)
//!   ├─→ TypeState[0] (BufferType<u64>) → primary: 3, active: [0, 3], free: [0]
//!   ├─→ TypeState[1] (BufferType<[u32; 4]>) → primary: 1, active: [1]
//!   ├─→ BufferState[0..limit]  (status, memory, free list)
//!   └─→ Hold lists
//!         ├─→ entry refs   → g=7: [0x00400003, ...]
//!         └─→ buffers      → g=6: [buffer 2], g=7: [old memory of 3]
//!
//! Arc<BufferTable> (shared)
//!   └─→ BufferSlot[0..num_buffers]  (AtomicPtr buffer, counters, status)
//!         ▲
//! DataStoreReader ──(GenerationGuard)──→ EntryRef(buffer_id | offset)
//! ```
//!
//! Retired memory moves through the hold lists and is released once
//! [`GenerationHandler`](crate::GenerationHandler) reports that no reader
//! guard is older than its generation.

pub mod allocator;
pub mod base;
pub mod buffer_state;
pub(crate) mod buffer_table;
pub mod buffer_type;
pub mod compaction;
pub mod entry_ref;
pub mod free_list;
pub mod memory_stats;
pub mod reader;
pub mod store;

pub use allocator::{Allocator, FreeListAllocator, Handle};
pub use base::DataStoreBase;
pub use buffer_state::{BufferState, BufferStatus};
pub use buffer_type::{BufferCounts, BufferType, BufferTypeBase, GrowthPolicy};
pub use compaction::{
    CompactBufferCandidates, CompactingBuffers, CompactionSpec, CompactionStrategy, EntryRefFilter,
};
pub use entry_ref::{EntryRef, RefLayout};
pub use free_list::{BufferFreeList, FreeList};
pub use memory_stats::{AddressSpace, BufferStatsSnapshot, MemoryStats, MemoryUsage};
pub use reader::DataStoreReader;
pub use store::DataStore;
